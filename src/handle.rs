// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Generation-counted handle table.
//
// A handle packs a slot index (low 32 bits) and the slot's generation at
// insertion time (high 32 bits). Removing an entry bumps the slot generation,
// so an old handle to a reused slot is rejected as stale instead of aliasing
// the new occupant. Generation 0 is never issued, which keeps the all-zero
// handle permanently invalid.

use slab::Slab;

use crate::error::{ShimError, ShimResult};

/// Opaque buffer-object handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoHandle(u64);

impl BoHandle {
    /// The null handle; never valid.
    pub const NULL: BoHandle = BoHandle(0);

    fn new(index: usize, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    /// Reinterpret a raw value (e.g. one received across an ABI boundary).
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    fn index(self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl std::fmt::Display for BoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bo#{}.{}", self.index(), self.generation())
    }
}

/// Arena of `T` addressed by [`BoHandle`].
#[derive(Debug)]
pub struct HandleTable<T> {
    entries: Slab<T>,
    generations: Vec<u32>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Slab::new(),
            generations: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, value: T) -> BoHandle {
        let index = self.entries.insert(value);
        if index >= self.generations.len() {
            self.generations.resize(index + 1, 1);
        }
        BoHandle::new(index, self.generations[index])
    }

    /// Classify `handle` without borrowing the entry.
    pub fn check(&self, handle: BoHandle) -> ShimResult<()> {
        let index = handle.index();
        let Some(&current) = self.generations.get(index) else {
            return Err(ShimError::InvalidHandle);
        };
        let generation = handle.generation();
        if generation == current && self.entries.contains(index) {
            Ok(())
        } else if generation != 0 && generation < current {
            Err(ShimError::StaleHandle)
        } else {
            Err(ShimError::InvalidHandle)
        }
    }

    pub fn get(&self, handle: BoHandle) -> ShimResult<&T> {
        self.check(handle)?;
        self.entries
            .get(handle.index())
            .ok_or(ShimError::InvalidHandle)
    }

    pub fn get_mut(&mut self, handle: BoHandle) -> ShimResult<&mut T> {
        self.check(handle)?;
        self.entries
            .get_mut(handle.index())
            .ok_or(ShimError::InvalidHandle)
    }

    pub fn remove(&mut self, handle: BoHandle) -> ShimResult<T> {
        self.check(handle)?;
        let index = handle.index();
        self.generations[index] = self.generations[index].wrapping_add(1).max(1);
        Ok(self.entries.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = (BoHandle, &T)> + '_ {
        self.entries
            .iter()
            .map(|(index, v)| (BoHandle::new(index, self.generations[index]), v))
    }

    /// Remove every entry; all outstanding handles become stale.
    pub fn clear(&mut self) -> Vec<T> {
        let handles: Vec<BoHandle> = self.iter().map(|(h, _)| h).collect();
        handles
            .into_iter()
            .filter_map(|h| self.remove(h).ok())
            .collect()
    }
}
