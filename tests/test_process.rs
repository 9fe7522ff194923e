// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Child process spawn / signal / reap.

#![cfg(unix)]

use std::time::Duration;

use swemu::proto::{force_kill, shutdown, spawn, try_reap, wait_for_exit, ProcessHandle};

fn args(a: &[&str]) -> Vec<String> {
    a.iter().map(|s| s.to_string()).collect()
}

#[test]
fn exit_code_is_reported() {
    let h = spawn("exit3", "/bin/sh", &args(&["-c", "exit 3"])).unwrap();
    assert!(h.valid());
    assert_eq!(h.name, "exit3");
    let r = wait_for_exit(&h, Duration::from_secs(5));
    assert!(r.finished());
    assert!(r.exited);
    assert_eq!(r.exit_code, 3);
    assert!(!r.signaled);
}

#[test]
fn shutdown_terminates_sleeper() {
    let h = spawn("sleeper", "/bin/sleep", &args(&["30"])).unwrap();
    assert!(h.is_alive());
    assert!(try_reap(&h).is_none());

    let r = shutdown(&h, Duration::from_secs(2));
    assert!(r.signaled);
    assert_eq!(r.signal, libc::SIGTERM);
    assert!(!h.is_alive());
}

#[test]
fn force_kill_is_sigkill() {
    let h = spawn("sleeper", "/bin/sleep", &args(&["30"])).unwrap();
    assert!(force_kill(&h));
    let r = wait_for_exit(&h, Duration::from_secs(5));
    assert!(r.signaled);
    assert_eq!(r.signal, libc::SIGKILL);
}

#[test]
fn missing_executable_fails_to_spawn() {
    assert!(spawn("ghost", "/nonexistent/swemu-device", &[]).is_err());
}

#[test]
fn nul_in_argument_is_rejected() {
    let err = spawn("bad", "/bin/sh", &args(&["a\0b"])).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}

#[test]
fn invalid_handle_is_inert() {
    let h = ProcessHandle {
        pid: 0,
        name: "none".into(),
        executable: String::new(),
    };
    assert!(!h.valid());
    assert!(!h.is_alive());
    assert!(!force_kill(&h));
    assert!(try_reap(&h).is_none());
    assert!(!shutdown(&h, Duration::from_millis(10)).finished());
}
