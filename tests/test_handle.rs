// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Generation-counted handle table.

use swemu::{BoHandle, HandleTable, ShimError};

#[test]
fn insert_and_get() {
    let mut t = HandleTable::new();
    let a = t.insert("a");
    let b = t.insert("b");
    assert_ne!(a, b);
    assert_eq!(*t.get(a).unwrap(), "a");
    assert_eq!(*t.get(b).unwrap(), "b");
    assert_eq!(t.len(), 2);
}

#[test]
fn null_handle_is_invalid() {
    let mut t = HandleTable::new();
    t.insert(1u32);
    assert!(matches!(t.get(BoHandle::NULL), Err(ShimError::InvalidHandle)));
}

#[test]
fn removed_handle_is_stale() {
    let mut t = HandleTable::new();
    let h = t.insert(7u32);
    assert_eq!(t.remove(h).unwrap(), 7);
    assert!(matches!(t.get(h), Err(ShimError::StaleHandle)));
    assert!(matches!(t.remove(h), Err(ShimError::StaleHandle)));
    assert!(t.is_empty());
}

#[test]
fn reused_slot_gets_new_generation() {
    let mut t = HandleTable::new();
    let old = t.insert(1u32);
    t.remove(old).unwrap();
    let new = t.insert(2u32);
    assert_ne!(old, new);
    assert!(matches!(t.get(old), Err(ShimError::StaleHandle)));
    assert_eq!(*t.get(new).unwrap(), 2);
}

#[test]
fn forged_handles_are_invalid() {
    let mut t = HandleTable::new();
    let h = t.insert(1u32);
    // Future generation of a live slot.
    let forged = BoHandle::from_raw(h.raw() + (1 << 32));
    assert!(matches!(t.get(forged), Err(ShimError::InvalidHandle)));
    // Index past the end.
    assert!(matches!(
        t.get(BoHandle::from_raw((1 << 32) | 999)),
        Err(ShimError::InvalidHandle)
    ));
}

#[test]
fn clear_makes_every_handle_stale() {
    let mut t = HandleTable::new();
    let hs: Vec<_> = (0..4u32).map(|i| t.insert(i)).collect();
    let mut dropped = t.clear();
    dropped.sort_unstable();
    assert_eq!(dropped, vec![0, 1, 2, 3]);
    for h in hs {
        assert!(matches!(t.get(h), Err(ShimError::StaleHandle)));
    }
}

#[test]
fn raw_round_trip() {
    let mut t = HandleTable::new();
    let h = t.insert(());
    assert_eq!(BoHandle::from_raw(h.raw()), h);
    assert!(h.to_string().starts_with("bo#"));
}
