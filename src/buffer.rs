// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Host-side byte storage backing a buffer object.
// Device-backed BOs get a zero-filled shadow allocated by the shim; user-pointer
// BOs wrap memory handed in by the caller. Clones share the same bytes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{ShimError, ShimResult};

/// A shared, fixed-length host buffer.
///
/// This is what [`Shim::map_bo`](crate::Shim::map_bo) hands back: a view of the
/// process-local shadow, not of simulated device memory. Bytes move between the
/// two only through `sync_bo`.
#[derive(Clone)]
pub struct HostBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    /// Create a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    /// Like [`HostBuffer::zeroed`], but `None` if the memory cannot be reserved.
    pub fn try_zeroed(len: usize) -> Option<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(len).ok()?;
        data.resize(len, 0);
        Some(Self::from_vec(data))
    }

    /// Create a buffer from raw bytes (copies the data).
    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Create a buffer taking ownership of a `Vec<u8>`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `self` and `other` share the same storage.
    pub fn same_storage(&self, other: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Copy `src` into the buffer at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) -> ShimResult<()> {
        let mut data = self.lock();
        let end = checked_end(offset, src.len(), data.len())?;
        data[offset..end].copy_from_slice(src);
        Ok(())
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> ShimResult<()> {
        let data = self.lock();
        let end = checked_end(offset, dst.len(), data.len())?;
        dst.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    /// Copy out `len` bytes starting at `offset`.
    pub fn read_vec(&self, offset: usize, len: usize) -> ShimResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    /// Snapshot of the whole buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Run `f` with exclusive access to the bytes.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}

impl From<Vec<u8>> for HostBuffer {
    fn from(v: Vec<u8>) -> Self {
        Self::from_vec(v)
    }
}

impl From<&[u8]> for HostBuffer {
    fn from(s: &[u8]) -> Self {
        Self::from_slice(s)
    }
}

fn checked_end(offset: usize, size: usize, len: usize) -> ShimResult<usize> {
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(end),
        _ => Err(ShimError::InvalidRange {
            offset: offset as u64,
            size: size as u64,
            len: len as u64,
        }),
    }
}
