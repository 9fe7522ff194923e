// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Buffer registry: handle -> buffer-object record.
//
// A record owns a device range unless it was imported, in which case it is an
// alias of another BO's range and freeing it must never release that range.

use std::collections::HashMap;

use tracing::debug;

use crate::buffer::HostBuffer;
use crate::error::{ShimError, ShimResult};
use crate::handle::{BoHandle, HandleTable};
use crate::mem::MemoryManager;
use crate::registry::ExportFd;

const FLAG_BANK_MASK: u32 = 0xffff;
const FLAG_BANK_ANY: u32 = 0xffff;
const FLAG_SLOT_SHIFT: u32 = 16;
const FLAG_SLOT_MASK: u32 = 0xff << FLAG_SLOT_SHIFT;
const FLAG_SLOT_NONE: u32 = 0xff;
const FLAG_CACHEABLE: u32 = 1 << 24;
const FLAG_USERPTR: u32 = 1 << 25;
const FLAG_IMPORTED: u32 = 1 << 26;
const FLAG_P2P: u32 = 1 << 30;

/// Allocation flags of a buffer object.
///
/// `bank` names a memory bank (domain); `None` lets the memory manager pick,
/// default bank first. `slot` carries the hardware context the allocation was
/// requested through; it is metadata only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoFlags {
    pub bank: Option<u16>,
    pub slot: Option<u8>,
    pub cacheable: bool,
    pub p2p: bool,
    pub userptr: bool,
    pub imported: bool,
}

impl BoFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn bank(mut self, bank: u16) -> Self {
        self.bank = Some(bank);
        self
    }

    #[must_use]
    pub const fn slot(mut self, slot: u8) -> Self {
        self.slot = Some(slot);
        self
    }

    #[must_use]
    pub const fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    #[must_use]
    pub const fn p2p(mut self) -> Self {
        self.p2p = true;
        self
    }

    /// Packed form: bank in bits 0..16, context slot in 16..24, attributes above.
    pub const fn to_bits(self) -> u32 {
        let mut bits = match self.bank {
            Some(b) => b as u32,
            None => FLAG_BANK_ANY,
        };
        bits |= match self.slot {
            Some(s) => (s as u32) << FLAG_SLOT_SHIFT,
            None => FLAG_SLOT_NONE << FLAG_SLOT_SHIFT,
        };
        if self.cacheable {
            bits |= FLAG_CACHEABLE;
        }
        if self.userptr {
            bits |= FLAG_USERPTR;
        }
        if self.imported {
            bits |= FLAG_IMPORTED;
        }
        if self.p2p {
            bits |= FLAG_P2P;
        }
        bits
    }

    pub const fn from_bits(bits: u32) -> Self {
        let bank = bits & FLAG_BANK_MASK;
        let slot = (bits & FLAG_SLOT_MASK) >> FLAG_SLOT_SHIFT;
        Self {
            bank: if bank == FLAG_BANK_ANY { None } else { Some(bank as u16) },
            slot: if slot == FLAG_SLOT_NONE { None } else { Some(slot as u8) },
            cacheable: bits & FLAG_CACHEABLE != 0,
            p2p: bits & FLAG_P2P != 0,
            userptr: bits & FLAG_USERPTR != 0,
            imported: bits & FLAG_IMPORTED != 0,
        }
    }
}

/// Direction of a `sync_bo` transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Host shadow -> simulated device memory.
    ToDevice,
    /// Simulated device memory -> host shadow.
    FromDevice,
}

/// Where a record's device range came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoOrigin {
    /// Fresh range from this device's memory manager.
    Allocated,
    /// Fresh range, host side backed by caller memory.
    UserPtr,
    /// Alias of a BO exported by `device`; owns nothing.
    Imported { fd: ExportFd, device: u32 },
}

#[derive(Debug, Clone)]
pub struct BoRecord {
    pub size: u64,
    pub flags: BoFlags,
    /// Simulated device address (on the exporting device for imports).
    pub addr: u64,
    pub shadow: HostBuffer,
    pub origin: BoOrigin,
    /// Descriptor handed out by `export_bo`, if any.
    pub export: Option<ExportFd>,
}

impl BoRecord {
    pub fn owns_range(&self) -> bool {
        !matches!(self.origin, BoOrigin::Imported { .. })
    }

    /// Validate `[offset, offset + size)` against the BO size.
    pub fn check_range(&self, offset: u64, size: u64) -> ShimResult<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ShimError::InvalidRange {
                offset,
                size,
                len: self.size,
            }),
        }
    }
}

/// Snapshot returned by `bo_properties`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoProperties {
    pub handle: BoHandle,
    pub size: u64,
    pub flags: BoFlags,
    pub paddr: u64,
}

// ---------------------------------------------------------------------------
// BufferRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct BufferRegistry {
    table: HandleTable<BoRecord>,
    /// Descriptor -> local alias, so re-importing yields the same handle.
    imports: HashMap<ExportFd, BoHandle>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Reserve a device range for `size` bytes and record a new BO backed by `shadow`.
    pub fn create(
        &mut self,
        mm: &mut MemoryManager,
        size: u64,
        flags: BoFlags,
        shadow: HostBuffer,
    ) -> ShimResult<BoHandle> {
        self.create_with(mm, size, flags, || Ok(shadow))
    }

    /// Like [`BufferRegistry::create`], but the host side is built only once
    /// the device range is reserved. The range is released if `shadow` fails.
    pub fn create_with(
        &mut self,
        mm: &mut MemoryManager,
        size: u64,
        flags: BoFlags,
        shadow: impl FnOnce() -> ShimResult<HostBuffer>,
    ) -> ShimResult<BoHandle> {
        let addr = mm
            .allocate(size, flags.bank.map(usize::from))
            .map_err(|e| match e {
                ShimError::OutOfMemory => ShimError::AllocationFailed { size },
                other => other,
            })?;
        let shadow = match shadow() {
            Ok(shadow) => shadow,
            Err(e) => {
                mm.release(addr);
                return Err(e);
            }
        };
        let origin = if flags.userptr {
            BoOrigin::UserPtr
        } else {
            BoOrigin::Allocated
        };
        let handle = self.table.insert(BoRecord {
            size,
            flags,
            addr,
            shadow,
            origin,
            export: None,
        });
        debug!(%handle, size, addr, "bo created");
        Ok(handle)
    }

    /// Record an alias created by importing `fd`.
    pub fn insert_import(&mut self, fd: ExportFd, record: BoRecord) -> BoHandle {
        let handle = self.table.insert(record);
        self.imports.insert(fd, handle);
        handle
    }

    /// The live local alias of `fd`, if it was imported before.
    pub fn cached_import(&self, fd: ExportFd) -> Option<BoHandle> {
        let handle = *self.imports.get(&fd)?;
        self.table.check(handle).ok().map(|_| handle)
    }

    pub fn get(&self, handle: BoHandle) -> ShimResult<&BoRecord> {
        self.table.get(handle)
    }

    pub fn get_mut(&mut self, handle: BoHandle) -> ShimResult<&mut BoRecord> {
        self.table.get_mut(handle)
    }

    /// Remove the record and, if it owns one, return its range to `mm`.
    ///
    /// A handle that was already freed is unknown here: `InvalidHandle`, not
    /// the `StaleHandle` other lookups report.
    pub fn free(&mut self, mm: &mut MemoryManager, handle: BoHandle) -> ShimResult<BoRecord> {
        let record = self.table.remove(handle).map_err(|e| match e {
            ShimError::StaleHandle => ShimError::InvalidHandle,
            other => other,
        })?;
        match record.origin {
            BoOrigin::Imported { fd, .. } => {
                if self.imports.get(&fd) == Some(&handle) {
                    self.imports.remove(&fd);
                }
            }
            BoOrigin::Allocated | BoOrigin::UserPtr => {
                mm.release(record.addr);
            }
        }
        debug!(%handle, "bo freed");
        Ok(record)
    }

    /// Drop every record without touching any memory manager.
    pub fn clear(&mut self) -> Vec<BoRecord> {
        self.imports.clear();
        self.table.clear()
    }
}
