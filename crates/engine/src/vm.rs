// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! VM process supervision.
//!
//! Turns a prepared task directory into a running microVM: builds the
//! declarative runner, spawns it on a PTY in its own process group, streams
//! the serial console to `serial.log`, and reports the exit code through a
//! caller-provided callback. Guest state is never interpreted here.

use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use mvo_core::{slot_dir, TaskId, TaskPaths};

use crate::pty;

/// Size cap of the per-slot sparse Nix store image.
pub const NIX_STORE_IMAGE_BYTES: u64 = 30 * 1024 * 1024 * 1024;

/// How long a graceful stop waits before escalating to SIGKILL.
pub const STOP_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM builder not found: no default.nix in {0}")]
    BuilderMissing(PathBuf),

    #[error("VM build failed: {stderr}")]
    BuildFailed { stderr: String },

    #[error("VM runner not found at {0}")]
    RunnerMissing(PathBuf),

    #[error("VM I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistent storage locations for one slot.
#[derive(Debug, Clone)]
pub struct SlotDirs {
    pub var_dir: PathBuf,
    pub container_dir: PathBuf,
    pub nix_store_image: PathBuf,
}

/// Ensure a slot's directories exist and its sparse store image is present.
///
/// The image is created with `set_len` only (a hole, not 30 GB of disk);
/// filesystem formatting is deferred to the guest's first boot.
pub fn prepare_slot_dirs(state_dir: &Path, slot: u32) -> std::io::Result<SlotDirs> {
    let dir = slot_dir(state_dir, slot);
    let dirs = SlotDirs {
        var_dir: dir.join("var"),
        container_dir: dir.join("container-storage"),
        nix_store_image: dir.join("nix-store.img"),
    };
    std::fs::create_dir_all(&dirs.var_dir)?;
    std::fs::create_dir_all(&dirs.container_dir)?;
    if !dirs.nix_store_image.exists() {
        let image = std::fs::File::create(&dirs.nix_store_image)?;
        image.set_len(NIX_STORE_IMAGE_BYTES)?;
        info!(slot, image = %dirs.nix_store_image.display(), "created sparse nix store image");
    }
    Ok(dirs)
}

/// Write the transient credential file, readable by owner only.
///
/// The guest contract requires the runner to delete it after reading; it is
/// never recreated on restart.
pub fn write_api_key(paths: &TaskPaths, token: &str) -> std::io::Result<()> {
    let path = paths.api_key();
    std::fs::write(&path, token)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
}

/// Inputs for one VM build.
pub struct BuildSpec<'a> {
    pub nix_dir: &'a Path,
    pub package: &'a str,
    pub slot: u32,
    pub paths: &'a TaskPaths,
    pub dirs: &'a SlotDirs,
}

/// Invoke the declarative builder and return the runner executable.
///
/// Configuration is passed via `--argstr`; each slot gets its own out-link
/// so parallel builds do not clobber each other.
pub fn build_vm(spec: &BuildSpec<'_>) -> Result<PathBuf, VmError> {
    if !spec.nix_dir.join("default.nix").exists() {
        return Err(VmError::BuilderMissing(spec.nix_dir.to_path_buf()));
    }

    let out_link = format!("result-mcp-{}", spec.slot);
    let argstr = [
        ("taskDir", spec.paths.dir().display().to_string()),
        ("varDir", spec.dirs.var_dir.display().to_string()),
        ("containerDir", spec.dirs.container_dir.display().to_string()),
        ("nixStoreImage", spec.dirs.nix_store_image.display().to_string()),
        ("socketPath", spec.paths.socket().display().to_string()),
        ("slot", spec.slot.to_string()),
    ];

    let mut cmd = Command::new("nix-build");
    cmd.args(["default.nix", "-A", spec.package, "-o", &out_link]).current_dir(spec.nix_dir);
    for (name, value) in &argstr {
        cmd.arg("--argstr").arg(name).arg(value);
    }

    let output = cmd.output()?;
    if !output.status.success() {
        return Err(VmError::BuildFailed { stderr: stderr_tail(&output.stderr, 20) });
    }

    // nix-build prints the store path last; fall back to the out-link.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let store_path = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| PathBuf::from(l.trim()))
        .filter(|p| p.exists())
        .unwrap_or_else(|| spec.nix_dir.join(&out_link));

    let runner = store_path.join("bin").join("microvm-run");
    if !runner.exists() {
        return Err(VmError::RunnerMissing(runner));
    }
    Ok(runner)
}

fn stderr_tail(stderr: &[u8], max_lines: usize) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Environment handed to the runner process (mirrored into the guest).
pub fn runner_env(
    repo_path: &Path,
    paths: &TaskPaths,
    slot: u32,
    dirs: &SlotDirs,
    package: &str,
) -> Vec<(String, String)> {
    vec![
        ("DELEGATE_GIT_DIR".into(), repo_path.join(".git").display().to_string()),
        ("DELEGATE_GIT_ROOT".into(), repo_path.display().to_string()),
        ("DELEGATE_TASK_DIR".into(), paths.dir().display().to_string()),
        ("DELEGATE_VAR_DIR".into(), dirs.var_dir.display().to_string()),
        ("DELEGATE_SOCKET".into(), paths.socket().display().to_string()),
        ("MICROVM_SLOT".into(), slot.to_string()),
        ("MICROVM_CONTAINER_DIR".into(), dirs.container_dir.display().to_string()),
        ("MICROVM_NIX_STORE_IMAGE".into(), dirs.nix_store_image.display().to_string()),
        ("MICROVM_PACKAGE".into(), package.to_string()),
    ]
}

/// Per-task process supervisor: one reader thread for the serial console,
/// one waiter thread for exit detection.
pub struct Supervisor {
    task_id: TaskId,
    pid: i32,
    done: Arc<AtomicBool>,
}

impl Supervisor {
    /// Spawn the runner on a fresh PTY in its own process group.
    ///
    /// `on_exit` fires exactly once, from the waiter thread, after the
    /// serial log has been closed.
    pub fn spawn(
        task_id: TaskId,
        runner: &Path,
        cwd: &Path,
        env: Vec<(String, String)>,
        serial_log: &Path,
        on_exit: impl FnOnce(i32) + Send + 'static,
    ) -> Result<Self, VmError> {
        let pair = pty::openpty()?;
        let stdin = pair.slave.try_clone()?;
        let stdout = pair.slave.try_clone()?;
        let stderr = pair.slave;

        let mut cmd = Command::new(runner);
        cmd.current_dir(cwd)
            .envs(env)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        // Own session and process group so stop() can signal the whole tree,
        // including a hypervisor wrapped in a shell.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let pid = child.id() as i32;
        info!(task = task_id.short(), pid, "spawned VM runner");

        let done = Arc::new(AtomicBool::new(false));

        // Reader: master PTY → serial.log until EOF.
        let master = std::fs::File::from(pair.master);
        let log_path = serial_log.to_path_buf();
        let reader_task = task_id.clone();
        std::thread::spawn(move || {
            if let Err(e) = stream_console(master, &log_path) {
                warn!(task = reader_task.short(), error = %e, "serial console reader stopped");
            }
        });

        // Waiter: reap the child, then report.
        let waiter_done = Arc::clone(&done);
        let waiter_task = task_id.clone();
        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => status
                    .code()
                    .unwrap_or_else(|| status.signal().map(|s| 128 + s).unwrap_or(-1)),
                Err(e) => {
                    warn!(task = waiter_task.short(), error = %e, "wait on VM runner failed");
                    -1
                }
            };
            info!(task = waiter_task.short(), exit_code = code, "VM runner exited");
            waiter_done.store(true, Ordering::SeqCst);
            on_exit(code);
        });

        Ok(Self { task_id, pid, done })
    }

    pub fn pid(&self) -> u32 {
        self.pid as u32
    }

    pub fn is_running(&self) -> bool {
        !self.done.load(Ordering::SeqCst)
    }

    /// Graceful stop: SIGTERM to the process group, SIGKILL after the
    /// deadline. The exit callback still fires from the waiter thread.
    pub fn stop(&self, deadline: Duration) {
        if !self.is_running() {
            return;
        }
        info!(task = self.task_id.short(), pid = self.pid, "stopping VM runner");
        // SAFETY: signalling a process group we created.
        unsafe {
            libc::killpg(self.pid, libc::SIGTERM);
        }
        let until = Instant::now() + deadline;
        while self.is_running() && Instant::now() < until {
            std::thread::sleep(Duration::from_millis(100));
        }
        if self.is_running() {
            warn!(task = self.task_id.short(), pid = self.pid, "VM runner ignored SIGTERM, killing");
            unsafe {
                libc::killpg(self.pid, libc::SIGKILL);
            }
        }
    }
}

/// Append everything the PTY master yields to the serial log, line-buffered
/// and lossily decoded.
fn stream_console(mut master: std::fs::File, log_path: &Path) -> std::io::Result<()> {
    let mut log = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;
    let mut buf = [0u8; 4096];
    loop {
        match master.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                log.write_all(String::from_utf8_lossy(&buf[..n]).as_bytes())?;
                log.flush()?;
            }
            // EIO means the slave side closed: the child exited.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Whether a PID from a previous run still names a live process.
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence/permission check.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(test)]
#[path = "vm_tests.rs"]
mod tests;
