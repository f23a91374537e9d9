// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::sync::mpsc;

#[test]
fn prepare_slot_dirs_creates_layout() {
    let state = tempfile::tempdir().unwrap();
    let dirs = prepare_slot_dirs(state.path(), 3).unwrap();

    assert!(dirs.var_dir.is_dir());
    assert!(dirs.container_dir.is_dir());
    assert!(dirs.nix_store_image.is_file());
    assert_eq!(dirs.var_dir, state.path().join("slots/3/var"));

    let meta = std::fs::metadata(&dirs.nix_store_image).unwrap();
    assert_eq!(meta.len(), NIX_STORE_IMAGE_BYTES);
}

#[test]
fn prepare_slot_dirs_keeps_existing_image() {
    let state = tempfile::tempdir().unwrap();
    let dirs = prepare_slot_dirs(state.path(), 1).unwrap();
    std::fs::write(&dirs.nix_store_image, b"formatted").unwrap();

    let again = prepare_slot_dirs(state.path(), 1).unwrap();
    assert_eq!(std::fs::read(&again.nix_store_image).unwrap(), b"formatted");
}

#[test]
fn api_key_file_is_owner_only() {
    let repo = tempfile::tempdir().unwrap();
    let paths = mvo_core::TaskPaths::new(repo.path(), &TaskId::new());
    std::fs::create_dir_all(paths.dir()).unwrap();
    write_api_key(&paths, "sk-secret").unwrap();

    let meta = std::fs::metadata(paths.api_key()).unwrap();
    assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    assert_eq!(std::fs::read_to_string(paths.api_key()).unwrap(), "sk-secret");
}

#[test]
fn build_vm_requires_builder_file() {
    let empty = tempfile::tempdir().unwrap();
    let repo = tempfile::tempdir().unwrap();
    let paths = mvo_core::TaskPaths::new(repo.path(), &TaskId::new());
    let dirs = prepare_slot_dirs(repo.path(), 1).unwrap();
    let spec = BuildSpec {
        nix_dir: empty.path(),
        package: "claude-microvm",
        slot: 1,
        paths: &paths,
        dirs: &dirs,
    };
    let err = build_vm(&spec).unwrap_err();
    assert!(matches!(err, VmError::BuilderMissing(_)));
}

#[test]
fn stderr_tail_keeps_last_lines() {
    let text: String = (0..40).map(|i| format!("line {i}\n")).collect();
    let tail = stderr_tail(text.as_bytes(), 20);
    assert!(tail.starts_with("line 20"));
    assert!(tail.ends_with("line 39"));
}

#[test]
fn runner_env_names_all_mounts() {
    let repo = tempfile::tempdir().unwrap();
    let paths = mvo_core::TaskPaths::new(repo.path(), &TaskId::new());
    let state = tempfile::tempdir().unwrap();
    let dirs = prepare_slot_dirs(state.path(), 2).unwrap();

    let env = runner_env(repo.path(), &paths, 2, &dirs, "claude-microvm");
    let get = |k: &str| {
        env.iter().find(|(key, _)| key.as_str() == k).map(|(_, v)| v.clone()).unwrap()
    };
    assert_eq!(get("MICROVM_SLOT"), "2");
    assert_eq!(get("MICROVM_PACKAGE"), "claude-microvm");
    assert!(get("DELEGATE_GIT_DIR").ends_with(".git"));
    assert!(get("MICROVM_NIX_STORE_IMAGE").ends_with("nix-store.img"));
}

#[test]
fn supervisor_streams_serial_and_reports_exit() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("serial.log");
    let script = dir.path().join("runner.sh");
    std::fs::write(&script, "#!/bin/sh\necho boot-banner\nexit 7\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (tx, rx) = mpsc::channel();
    let supervisor = Supervisor::spawn(
        TaskId::new(),
        &script,
        dir.path(),
        vec![],
        &log,
        move |code| {
            let _ = tx.send(code);
        },
    )
    .unwrap();
    assert!(supervisor.pid() > 0);

    let code = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(code, 7);

    // Reader thread may still be flushing the final chunk.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let content = std::fs::read_to_string(&log).unwrap_or_default();
        if content.contains("boot-banner") {
            break;
        }
        assert!(Instant::now() < deadline, "serial.log never got the banner: {content:?}");
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(!supervisor.is_running());
}

#[test]
fn stop_terminates_a_stubborn_child() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("serial.log");
    let script = dir.path().join("runner.sh");
    std::fs::write(&script, "#!/bin/sh\nsleep 600\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (tx, rx) = mpsc::channel();
    let supervisor = Supervisor::spawn(
        TaskId::new(),
        &script,
        dir.path(),
        vec![],
        &log,
        move |code| {
            let _ = tx.send(code);
        },
    )
    .unwrap();

    supervisor.stop(Duration::from_secs(5));
    let code = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_ne!(code, 0);
    assert!(!supervisor.is_running());
}

#[test]
fn pid_alive_distinguishes_live_and_dead() {
    assert!(pid_alive(std::process::id()));
    // PID beyond the default pid_max is never allocated.
    assert!(!pid_alive(4_000_000));
}
