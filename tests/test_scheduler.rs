// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Request table and FIFO completion through an emulated device.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use swemu::config::uniform_banks;
use swemu::emulator::{DeviceOptions, DeviceServer};
use swemu::proto::message::Completion;
use swemu::{
    BoFlags, ComputeUnit, Config, DeviceRegistry, Failure, ImageLayout, RequestState, Scheduler,
    Shim, ShimError, SyncDirection,
};
use uuid::Uuid;

fn done(request_id: u64, status: u32) -> Completion {
    Completion { request_id, status }
}

// ========== Scheduler ==========

#[test]
fn ids_are_unique_and_increasing() {
    let s = Scheduler::new();
    let a = s.enqueue(0);
    let b = s.enqueue(1);
    let c = s.enqueue(0);
    assert!(a < b && b < c);
    assert_eq!(s.pending(), 3);
    assert_eq!(s.state(a), Some(RequestState::Queued));
}

#[test]
fn submitted_then_completed_is_consumed_once() {
    let s = Scheduler::new();
    let id = s.enqueue(0);
    s.mark_submitted(id);
    assert_eq!(s.state(id), Some(RequestState::Submitted));

    s.complete(&[done(id, 0)]);
    assert_eq!(s.state(id), Some(RequestState::Completed));
    assert_eq!(s.pending(), 0);
    s.wait(id, Duration::ZERO).unwrap();
    assert!(matches!(s.wait(id, Duration::ZERO), Err(ShimError::NotFound(_))));
    assert_eq!(s.state(id), None);
}

#[test]
fn device_status_becomes_command_failed() {
    let s = Scheduler::new();
    let id = s.enqueue(2);
    s.mark_submitted(id);
    s.complete(&[done(id, 7)]);
    assert_eq!(s.state(id), Some(RequestState::Failed(Failure::Status(7))));
    assert!(matches!(
        s.wait(id, Duration::ZERO),
        Err(ShimError::CommandFailed { id: i, status: 7 }) if i == id
    ));
}

#[test]
fn late_ack_does_not_undo_completion() {
    let s = Scheduler::new();
    let id = s.enqueue(0);
    s.complete(&[done(id, 0)]);
    s.mark_submitted(id);
    assert_eq!(s.state(id), Some(RequestState::Completed));
}

#[test]
fn duplicate_and_unknown_completions_are_ignored() {
    let s = Scheduler::new();
    let id = s.enqueue(0);
    s.complete(&[done(id, 0), done(id, 9), done(12345, 0)]);
    assert_eq!(s.state(id), Some(RequestState::Completed));
    assert_eq!(s.state(12345), None);
}

#[test]
fn discard_forgets_request() {
    let s = Scheduler::new();
    let id = s.enqueue(0);
    s.discard(id);
    assert_eq!(s.pending(), 0);
    assert!(matches!(s.wait(id, Duration::ZERO), Err(ShimError::NotFound(_))));
}

#[test]
fn wait_times_out_and_request_survives() {
    let s = Scheduler::new();
    let id = s.enqueue(0);
    s.mark_submitted(id);

    let start = Instant::now();
    assert!(matches!(
        s.wait(id, Duration::from_millis(20)),
        Err(ShimError::TimedOut)
    ));
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert_eq!(s.state(id), Some(RequestState::Submitted));
    assert_eq!(s.pending(), 1);
}

#[test]
fn fail_all_wakes_waiters() {
    let s = Arc::new(Scheduler::new());
    let ids: Vec<_> = (0..3).map(|cu| s.enqueue(cu)).collect();
    let finished = s.enqueue(0);
    s.complete(&[done(finished, 0)]);

    let waiters: Vec<_> = ids
        .iter()
        .map(|&id| {
            let s = Arc::clone(&s);
            thread::spawn(move || s.wait(id, Duration::from_secs(10)))
        })
        .collect();
    thread::sleep(Duration::from_millis(20));
    s.fail_all(Failure::TransportLost("peer hung up".into()));

    for w in waiters {
        assert!(matches!(w.join().unwrap(), Err(ShimError::TransportLost(_))));
    }
    // Settled requests keep their outcome.
    s.wait(finished, Duration::ZERO).unwrap();
}

#[test]
fn waiter_is_woken_by_completion() {
    let s = Arc::new(Scheduler::new());
    let id = s.enqueue(0);
    s.mark_submitted(id);
    let completer = {
        let s = Arc::clone(&s);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            s.complete(&[done(id, 0)]);
        })
    };
    s.wait(id, Duration::from_secs(10)).unwrap();
    completer.join().unwrap();
}

// ========== Through the shim ==========

fn device(latency: Duration) -> (DeviceRegistry, Arc<Shim>) {
    let reg = DeviceRegistry::new(Config {
        banks: uniform_banks(1, 0x10_0000),
        ..Config::default()
    });
    let (host, dev) = UnixStream::pair().unwrap();
    let server = DeviceServer::new(
        0,
        DeviceOptions {
            exec_latency: latency,
            ..DeviceOptions::default()
        },
    );
    thread::spawn(move || server.serve(dev));
    let shim = reg.attach(0, host).unwrap();
    shim.load_image(
        ImageLayout::new(
            Uuid::from_u128(1),
            vec![
                ComputeUnit::new("k:k_1", 0x1000, 0x1000),
                ComputeUnit::new("k:k_2", 0x2000, 0x1000),
            ],
        )
        .unwrap(),
    )
    .unwrap();
    (reg, shim)
}

#[test]
fn completions_arrive_in_submission_order() {
    let (_reg, shim) = device(Duration::from_millis(1));
    let cmd = shim.alloc_bo(16, BoFlags::new()).unwrap();
    let ids: Vec<_> = (0..8).map(|i| shim.exec_buf(i % 2, cmd).unwrap()).collect();

    for (k, &id) in ids.iter().enumerate().rev().step_by(3) {
        shim.exec_wait(id, Duration::from_secs(5)).unwrap();
        for &earlier in &ids[..k] {
            assert!(matches!(
                shim.request_state(earlier),
                Some(RequestState::Completed) | None
            ));
        }
    }
}

#[test]
fn timed_out_wait_can_be_retried() {
    let (_reg, shim) = device(Duration::from_millis(200));
    let cmd = shim.alloc_bo(16, BoFlags::new()).unwrap();
    let id = shim.exec_buf(0, cmd).unwrap();

    assert!(matches!(
        shim.exec_wait(id, Duration::from_millis(10)),
        Err(ShimError::TimedOut)
    ));
    assert_eq!(shim.request_state(id), Some(RequestState::Submitted));
    shim.exec_wait(id, Duration::from_secs(5)).unwrap();
    assert_eq!(shim.request_state(id), None);
}

#[test]
fn close_fails_pending_requests() {
    let (_reg, shim) = device(Duration::from_secs(2));
    let cmd = shim.alloc_bo(16, BoFlags::new()).unwrap();
    let id = shim.exec_buf(1, cmd).unwrap();

    let waiter = {
        let shim = Arc::clone(&shim);
        thread::spawn(move || shim.exec_wait(id, Duration::from_secs(10)))
    };
    thread::sleep(Duration::from_millis(20));
    shim.close();
    assert!(matches!(waiter.join().unwrap(), Err(ShimError::DeviceClosed)));
    // The waiter consumed the outcome.
    assert_eq!(shim.request_state(id), None);
    assert!(matches!(shim.exec_buf(1, cmd), Err(ShimError::DeviceClosed)));
}

#[test]
fn close_without_waiter_keeps_failure_visible() {
    let (_reg, shim) = device(Duration::from_secs(2));
    let cmd = shim.alloc_bo(16, BoFlags::new()).unwrap();
    let id = shim.exec_buf(0, cmd).unwrap();
    shim.close();
    assert_eq!(
        shim.request_state(id),
        Some(RequestState::Failed(Failure::DeviceClosed))
    );
}

#[test]
fn buffer_work_proceeds_while_a_wait_blocks() {
    let (_reg, shim) = device(Duration::from_millis(500));
    let cmd = shim.alloc_bo(16, BoFlags::new()).unwrap();
    let id = shim.exec_buf(0, cmd).unwrap();

    let waiter = {
        let shim = Arc::clone(&shim);
        thread::spawn(move || {
            shim.exec_wait(id, Duration::from_secs(10)).unwrap();
            Instant::now()
        })
    };
    thread::sleep(Duration::from_millis(20));

    let bo = shim.alloc_bo(8192, BoFlags::new()).unwrap();
    shim.map_bo(bo).unwrap().write(0, &[0x5a; 8192]).unwrap();
    shim.sync_bo(bo, SyncDirection::ToDevice, 8192, 0).unwrap();
    shim.sync_bo(bo, SyncDirection::FromDevice, 8192, 0).unwrap();
    shim.free_bo(bo).unwrap();
    let buffers_done = Instant::now();

    let waited = waiter.join().unwrap();
    assert!(buffers_done < waited);
}
