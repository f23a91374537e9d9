// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pseudoterminal allocation for headless VM serial consoles.
//!
//! The VM runner expects a terminal on stdio; we hand it the slave end of a
//! PTY pair and read the serial console from the master end.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// A master/slave PTY pair.
///
/// The slave end is attached to the child's stdio at spawn time; the master
/// end stays in the parent and yields the console byte stream. Both ends are
/// closed on drop.
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a new PTY pair in blocking mode.
pub fn openpty() -> io::Result<PtyPair> {
    let mut master_fd: RawFd = -1;
    let mut slave_fd: RawFd = -1;

    // SAFETY: openpty writes two valid fds on success; ownership is
    // transferred to OwnedFd immediately so they cannot leak.
    let rc = unsafe {
        libc::openpty(
            &mut master_fd,
            &mut slave_fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let (master, slave) = unsafe { (OwnedFd::from_raw_fd(master_fd), OwnedFd::from_raw_fd(slave_fd)) };
    Ok(PtyPair { master, slave })
}

#[cfg(test)]
#[path = "pty_tests.rs"]
mod tests;
