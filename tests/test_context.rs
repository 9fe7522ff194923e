// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Hardware contexts and compute-unit reservations.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use swemu::config::uniform_banks;
use swemu::emulator::{DeviceOptions, DeviceServer};
use swemu::{
    AccessMode, BoFlags, ComputeUnit, Config, DeviceRegistry, HostBuffer, ImageLayout, Qos, Shim,
    ShimError,
};
use uuid::Uuid;

const IMAGE: Uuid = Uuid::from_u128(0x5eed);

fn layout(uuid: Uuid) -> ImageLayout {
    ImageLayout::new(
        uuid,
        vec![
            ComputeUnit::new("vadd:vadd_1", 0x1800000, 0x1000),
            ComputeUnit::new("vadd:vadd_2", 0x1810000, 0x1000),
        ],
    )
    .unwrap()
}

fn device() -> (DeviceRegistry, Arc<Shim>) {
    let reg = DeviceRegistry::new(Config {
        banks: uniform_banks(1, 0x10_0000),
        ..Config::default()
    });
    let (host, dev) = UnixStream::pair().unwrap();
    let server = DeviceServer::new(0, DeviceOptions::default());
    thread::spawn(move || server.serve(dev));
    let shim = reg.attach(0, host).unwrap();
    (reg, shim)
}

fn loaded() -> (DeviceRegistry, Arc<Shim>) {
    let (reg, shim) = device();
    shim.load_image(layout(IMAGE)).unwrap();
    (reg, shim)
}

#[test]
fn exclusive_cu_is_busy_for_others() {
    let (_reg, shim) = loaded();
    let a = shim.create_hw_context(IMAGE, Qos::new(), AccessMode::Exclusive).unwrap();
    let b = shim.create_hw_context(IMAGE, Qos::new(), AccessMode::Shared).unwrap();
    assert_ne!(a.id(), b.id());

    assert_eq!(a.open_cu_context("vadd:vadd_1").unwrap(), 0);
    assert!(matches!(b.open_cu_context("vadd:vadd_1"), Err(ShimError::Busy(_))));
    // The other CU is free.
    assert_eq!(b.open_cu_context("vadd:vadd_2").unwrap(), 1);

    drop(a);
    assert_eq!(b.open_cu_context("vadd:vadd_1").unwrap(), 0);
}

#[test]
fn shared_holders_coexist_until_exclusive_asks() {
    let (_reg, shim) = loaded();
    let s1 = shim.create_hw_context(IMAGE, Qos::new(), AccessMode::Shared).unwrap();
    let s2 = shim.create_hw_context(IMAGE, Qos::new(), AccessMode::Shared).unwrap();
    let ex = shim.create_hw_context(IMAGE, Qos::new(), AccessMode::Exclusive).unwrap();

    s1.open_cu_context("vadd:vadd_2").unwrap();
    s2.open_cu_context("vadd:vadd_2").unwrap();
    assert!(matches!(ex.open_cu_context("vadd:vadd_2"), Err(ShimError::Busy(_))));

    s1.close_cu_context(1).unwrap();
    assert!(matches!(ex.open_cu_context("vadd:vadd_2"), Err(ShimError::Busy(_))));
    s2.close_cu_context(1).unwrap();
    assert_eq!(ex.open_cu_context("vadd:vadd_2").unwrap(), 1);
}

#[test]
fn reopening_held_cu_in_same_context_is_fine() {
    let (_reg, shim) = loaded();
    let ex = shim.create_hw_context(IMAGE, Qos::new(), AccessMode::Exclusive).unwrap();
    ex.open_cu_context("vadd:vadd_1").unwrap();
    ex.open_cu_context("vadd:vadd_1").unwrap();
    ex.close_cu_context(0).unwrap();
    assert!(matches!(ex.close_cu_context(0), Err(ShimError::InvalidCu(0))));
}

#[test]
fn context_needs_matching_image() {
    let (_reg, shim) = device();
    assert!(matches!(
        shim.create_hw_context(IMAGE, Qos::new(), AccessMode::Shared),
        Err(ShimError::NotFound(_))
    ));
    shim.load_image(layout(IMAGE)).unwrap();
    assert!(matches!(
        shim.create_hw_context(Uuid::from_u128(0xdead), Qos::new(), AccessMode::Shared),
        Err(ShimError::NotFound(_))
    ));

    let mut qos = Qos::new();
    qos.insert("priority".into(), 3);
    let ctx = shim.create_hw_context(IMAGE, qos, AccessMode::Shared).unwrap();
    assert_eq!(ctx.uuid(), IMAGE);
    assert_eq!(ctx.qos().get("priority"), Some(&3));
    assert_eq!(ctx.mode(), AccessMode::Shared);
    assert!(Arc::ptr_eq(ctx.shim(), &shim));
    assert!(matches!(ctx.open_cu_context("mmult:mmult_1"), Err(ShimError::NotFound(_))));
}

#[test]
fn image_swap_waits_for_contexts() {
    let (_reg, shim) = loaded();
    let ctx = shim.create_hw_context(IMAGE, Qos::new(), AccessMode::Shared).unwrap();
    let other = Uuid::from_u128(0xbeef);
    assert!(matches!(shim.load_image(layout(other)), Err(ShimError::Busy(_))));
    assert_eq!(shim.image().unwrap().uuid(), IMAGE);

    drop(ctx);
    shim.load_image(layout(other)).unwrap();
    assert_eq!(shim.device_info().image, Some(other));
}

#[test]
fn image_never_changes_under_a_live_context() {
    let (_reg, shim) = loaded();
    let other = Uuid::from_u128(0xbeef);

    let swapper = {
        let shim = Arc::clone(&shim);
        thread::spawn(move || {
            for i in 0..200 {
                let next = if i % 2 == 0 { other } else { IMAGE };
                match shim.load_image(layout(next)) {
                    Ok(()) | Err(ShimError::Busy(_)) => {}
                    Err(e) => panic!("load_image: {e}"),
                }
            }
        })
    };

    let mut bound = 0;
    loop {
        let finished = swapper.is_finished();
        for uuid in [IMAGE, other] {
            if let Ok(ctx) = shim.create_hw_context(uuid, Qos::new(), AccessMode::Shared) {
                bound += 1;
                assert_eq!(shim.image().unwrap().uuid(), ctx.uuid());
                ctx.open_cu_context("vadd:vadd_1").unwrap();
                assert_eq!(shim.image().unwrap().uuid(), ctx.uuid());
            }
        }
        if finished {
            break;
        }
    }
    swapper.join().unwrap();
    assert!(bound > 0);
}

#[test]
fn exec_needs_cu_opened_in_context() {
    let (_reg, shim) = loaded();
    let ctx = shim.create_hw_context(IMAGE, Qos::new(), AccessMode::Shared).unwrap();
    let cmd = ctx.alloc_bo(16, BoFlags::new()).unwrap();

    let before = shim.exchange_count();
    assert!(matches!(ctx.exec_buf(0, cmd), Err(ShimError::InvalidCu(0))));
    assert!(matches!(ctx.exec_buf(5, cmd), Err(ShimError::InvalidCu(5))));
    assert_eq!(shim.exchange_count(), before);

    let cu = ctx.open_cu_context("vadd:vadd_1").unwrap();
    let id = ctx.exec_buf(cu, cmd).unwrap();
    ctx.exec_wait(id, Duration::from_secs(5)).unwrap();

    ctx.close_cu_context(cu).unwrap();
    assert!(matches!(ctx.exec_buf(cu, cmd), Err(ShimError::InvalidCu(_))));
    // The device-level path is not bound by contexts.
    let id = shim.exec_buf(cu, cmd).unwrap();
    shim.exec_wait(id, Duration::from_secs(5)).unwrap();
}

#[test]
fn context_allocations_carry_slot() {
    let (_reg, shim) = loaded();
    let ctx = shim.create_hw_context(IMAGE, Qos::new(), AccessMode::Shared).unwrap();
    assert_eq!(ctx.slot(), 0);

    let bo = ctx.alloc_bo(4096, BoFlags::new()).unwrap();
    assert_eq!(shim.bo_properties(bo).unwrap().flags.slot, Some(0));
    let up = ctx
        .alloc_userptr_bo(HostBuffer::zeroed(64), 64, BoFlags::new())
        .unwrap();
    let flags = shim.bo_properties(up).unwrap().flags;
    assert_eq!(flags.slot, Some(0));
    assert!(flags.userptr);

    let plain = shim.alloc_bo(4096, BoFlags::new()).unwrap();
    assert_eq!(shim.bo_properties(plain).unwrap().flags.slot, None);
}

#[test]
fn contexts_on_closed_device() {
    let (_reg, shim) = loaded();
    let ctx = shim.create_hw_context(IMAGE, Qos::new(), AccessMode::Exclusive).unwrap();
    let cu = ctx.open_cu_context("vadd:vadd_2").unwrap();
    shim.close();
    assert!(matches!(
        shim.create_hw_context(IMAGE, Qos::new(), AccessMode::Shared),
        Err(ShimError::DeviceClosed)
    ));
    assert!(matches!(ctx.alloc_bo(64, BoFlags::new()), Err(ShimError::DeviceClosed)));
    ctx.close_cu_context(cu).unwrap();
}
