// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event bus: a process-wide FIFO of terminal-transition events.
//!
//! Producers are VM supervisor threads; consumers are tool handlers on the
//! server's worker pool. Two wait surfaces cover both worlds: a blocking
//! wait with a Condvar and a cooperative wait driven by a tokio `Notify`.
//! Each event is delivered to exactly one consumer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use mvo_core::TaskEvent;

/// Outcome of an async wait.
#[derive(Debug)]
pub enum WaitOutcome {
    Event(TaskEvent),
    Timeout,
    /// The wait was cancelled by the transport; no queued event was consumed.
    Cancelled,
}

struct Inner {
    queue: Mutex<VecDeque<TaskEvent>>,
    condvar: Condvar,
    notify: Notify,
}

/// Cloneable handle to the process-wide event queue.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                condvar: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue an event. Non-blocking, never drops.
    pub fn emit(&self, event: TaskEvent) {
        self.inner.queue.lock().push_back(event);
        // Wake one blocking waiter and one async waiter; whichever exists
        // pops the event, the other re-checks and goes back to sleep.
        self.inner.condvar.notify_one();
        self.inner.notify.notify_one();
    }

    /// Pop the next event without waiting.
    pub fn try_next(&self) -> Option<TaskEvent> {
        self.inner.queue.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    /// Block up to `timeout` for the next event.
    pub fn wait(&self, timeout: Duration) -> Option<TaskEvent> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.queue.lock();
        loop {
            if let Some(event) = queue.pop_front() {
                return Some(event);
            }
            if self.inner.condvar.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop_front();
            }
        }
    }

    /// Cooperatively wait up to `timeout` for the next event.
    ///
    /// Cancellation is surfaced distinctly from timeout and consumes no
    /// queued event.
    pub async fn wait_async(&self, timeout: Duration, cancel: &CancellationToken) -> WaitOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking the queue so an emit between
            // the check and the await leaves a stored permit.
            let notified = self.inner.notify.notified();
            if let Some(event) = self.try_next() {
                return WaitOutcome::Event(event);
            }
            tokio::select! {
                _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return match self.try_next() {
                        Some(event) => WaitOutcome::Event(event),
                        None => WaitOutcome::Timeout,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "event_bus_tests.rs"]
mod tests;
