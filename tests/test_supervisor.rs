// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Launching, losing and relaunching the swemu-device process.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use swemu::config::uniform_banks;
use swemu::{
    BoFlags, ComputeUnit, Config, DeviceRegistry, ImageLayout, ShimError, SyncDirection,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_env("SWEMU_LOG"))
        .try_init();
}

fn config(dir: &tempfile::TempDir, args: &[&str]) -> Config {
    init_logging();
    Config {
        device_binary: Some(PathBuf::from(env!("CARGO_BIN_EXE_swemu-device"))),
        device_args: args.iter().map(|s| s.to_string()).collect(),
        socket_dir: dir.path().to_path_buf(),
        banks: uniform_banks(2, 0x10_0000),
        device_count: 2,
        launch_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_millis(500),
        ..Config::default()
    }
}

fn image() -> ImageLayout {
    ImageLayout::new(
        Uuid::from_u128(0xfeed),
        vec![ComputeUnit::new("scale:scale_1", 0x1800000, 0x1000)],
    )
    .unwrap()
}

fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[test]
fn launched_device_serves_data_path() {
    let dir = tempfile::tempdir().unwrap();
    let reg = DeviceRegistry::new(config(&dir, &[]));
    let shim = reg.open(0).unwrap();
    let pid = shim.device_pid().unwrap();
    assert!(pid_alive(pid));
    assert_eq!(shim.device_info().name, "swemu:0");

    let bo = shim.alloc_bo(4096, BoFlags::new()).unwrap();
    let host = shim.map_bo(bo).unwrap();
    host.write(0, b"over the socket").unwrap();
    shim.sync_bo(bo, SyncDirection::ToDevice, 4096, 0).unwrap();
    host.with_mut(|b| b.fill(0));
    shim.sync_bo(bo, SyncDirection::FromDevice, 4096, 0).unwrap();
    assert_eq!(host.read_vec(0, 15).unwrap(), b"over the socket");

    // Socket files are removed once connected.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    shim.close();
    assert_eq!(shim.device_pid(), None);
    assert!(!pid_alive(pid));
}

#[test]
fn concurrent_open_launches_once() {
    let dir = tempfile::tempdir().unwrap();
    let reg = DeviceRegistry::new(config(&dir, &[]));
    let opened: Vec<_> = (0..4)
        .map(|_| {
            let reg = reg.clone();
            thread::spawn(move || reg.open(1).unwrap())
        })
        .collect();
    let shims: Vec<_> = opened.into_iter().map(|t| t.join().unwrap()).collect();
    for s in &shims[1..] {
        assert!(Arc::ptr_eq(s, &shims[0]));
    }
    assert_eq!(shims[0].index(), 1);
}

#[test]
fn killed_device_fails_pending_wait_then_closes() {
    let dir = tempfile::tempdir().unwrap();
    let reg = DeviceRegistry::new(config(&dir, &["--exec-latency-ms", "2000"]));
    let shim = reg.open(0).unwrap();
    shim.load_image(image()).unwrap();
    let cmd = shim.alloc_bo(16, BoFlags::new()).unwrap();
    let id = shim.exec_buf(0, cmd).unwrap();

    let waiter = {
        let shim = Arc::clone(&shim);
        thread::spawn(move || shim.exec_wait(id, WAIT))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(shim.kill_device());

    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err, ShimError::TransportLost(_)), "{err}");
    assert!(!shim.is_good());
    assert!(matches!(shim.alloc_bo(16, BoFlags::new()), Err(ShimError::DeviceClosed)));
    assert!(matches!(shim.reg_read(0, 0), Err(ShimError::DeviceClosed)));
}

#[test]
fn reopen_starts_a_fresh_device() {
    let dir = tempfile::tempdir().unwrap();
    let reg = DeviceRegistry::new(config(&dir, &[]));
    let shim = reg.open(0).unwrap();
    shim.load_image(image()).unwrap();
    let bo = shim.alloc_bo(4096, BoFlags::new()).unwrap();
    shim.reg_write(0, 0x10, 99).unwrap();
    let first = shim.device_pid().unwrap();

    // Already good: nothing happens.
    shim.reopen().unwrap();
    assert_eq!(shim.device_pid(), Some(first));

    unsafe {
        libc::kill(first as libc::pid_t, libc::SIGKILL);
    }
    // The loss is noticed on the first exchange after the process is gone.
    for _ in 0..500 {
        if shim.reg_read(0, 0x10).is_err() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!shim.is_good());

    shim.reopen().unwrap();
    assert!(shim.is_good());
    let second = shim.device_pid().unwrap();
    assert_ne!(first, second);

    assert!(matches!(shim.map_bo(bo), Err(ShimError::StaleHandle)));
    assert_eq!(shim.device_info().banks[0].used, 0);
    // The image was sent again; registers start over.
    assert_eq!(shim.image().unwrap().uuid(), Uuid::from_u128(0xfeed));
    assert_eq!(shim.reg_read(0, 0x10).unwrap(), 0);

    let cmd = shim.alloc_bo(16, BoFlags::new()).unwrap();
    let id = shim.exec_buf(0, cmd).unwrap();
    shim.exec_wait(id, WAIT).unwrap();
}

#[test]
fn open_after_close_relaunches() {
    let dir = tempfile::tempdir().unwrap();
    let reg = DeviceRegistry::new(config(&dir, &[]));
    let shim = reg.open(0).unwrap();
    let first = shim.device_pid().unwrap();
    shim.close();

    let again = reg.open(0).unwrap();
    assert!(Arc::ptr_eq(&shim, &again));
    assert!(again.is_good());
    assert_ne!(again.device_pid(), Some(first));
    again.alloc_bo(4096, BoFlags::new()).unwrap();
}

#[test]
fn dropping_last_shim_stops_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let reg = DeviceRegistry::new(config(&dir, &[]));
    let shim = reg.open(0).unwrap();
    let pid = shim.device_pid().unwrap();
    drop(shim);
    assert!(reg.get(0).is_none());
    assert!(!pid_alive(pid));
}

#[test]
fn missing_binary_is_launch_error() {
    let dir = tempfile::tempdir().unwrap();
    let reg = DeviceRegistry::new(Config {
        device_binary: Some(dir.path().join("no-such-binary")),
        ..config(&dir, &[])
    });
    assert!(matches!(reg.open(0), Err(ShimError::Launch(_))));
    assert!(reg.get(0).is_none());
}

#[test]
fn binary_that_exits_early_is_launch_error() {
    let dir = tempfile::tempdir().unwrap();
    let reg = DeviceRegistry::new(config(&dir, &["--no-such-flag"]));
    match reg.open(0) {
        Err(ShimError::Launch(msg)) => assert!(!msg.is_empty()),
        other => panic!("unexpected: {other:?}"),
    }
    assert!(reg.get(0).is_none());
}

#[test]
fn launch_times_out_when_device_never_connects() {
    let dir = tempfile::tempdir().unwrap();
    let reg = DeviceRegistry::new(Config {
        device_binary: Some(PathBuf::from("/bin/sleep")),
        device_args: Vec::new(),
        launch_timeout: Duration::from_millis(200),
        ..config(&dir, &[])
    });
    assert!(matches!(reg.open(0), Err(ShimError::Launch(_))));
}
