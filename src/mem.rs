// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-bank allocator for the simulated device address space.
//
// Each bank keeps two maps:
//   free : start -> len   (coalesced holes)
//   busy : start -> len   (live allocations)
//
// Allocation is best-fit over the holes (smallest sufficient, lowest address on
// ties). Freed ranges merge with their neighbours. Not thread-safe; the shim
// calls it only under its resource lock.

use std::collections::{BTreeMap, HashMap};

use crate::config::BankConfig;
use crate::error::{ShimError, ShimResult};

/// Allocation granularity (one 4 KiB page).
pub const ALIGNMENT: u64 = 4096;

fn align_up(val: u64, align: u64) -> Option<u64> {
    val.checked_add(align - 1).map(|v| v & !(align - 1))
}

// ---------------------------------------------------------------------------
// Bank
// ---------------------------------------------------------------------------

/// One simulated memory region.
#[derive(Debug)]
pub struct Bank {
    tag: String,
    base: u64,
    size: u64,
    free: BTreeMap<u64, u64>,
    busy: HashMap<u64, u64>,
    used: u64,
}

impl Bank {
    pub fn new(tag: &str, base: u64, size: u64) -> Self {
        // Only whole pages are handed out; a trailing partial page is unusable.
        let usable = size & !(ALIGNMENT - 1);
        let mut free = BTreeMap::new();
        if usable > 0 {
            free.insert(base, usable);
        }
        Self {
            tag: tag.to_owned(),
            base,
            size,
            free,
            busy: HashMap::new(),
            used: 0,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// Live allocations as `(start, len)`, unordered.
    pub fn allocations(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.busy.iter().map(|(&s, &l)| (s, l))
    }

    /// Largest contiguous hole.
    pub fn largest_free(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }

    fn allocate(&mut self, size: u64) -> Option<u64> {
        let (&start, &len) = self
            .free
            .iter()
            .filter(|&(_, &len)| len >= size)
            .min_by_key(|&(&start, &len)| (len, start))?;

        self.free.remove(&start);
        if len > size {
            self.free.insert(start + size, len - size);
        }
        self.busy.insert(start, size);
        self.used += size;
        Some(start)
    }

    /// Return the allocation starting at `addr`. Returns its length.
    fn release(&mut self, addr: u64) -> Option<u64> {
        let len = self.busy.remove(&addr)?;
        self.used -= len;

        let mut start = addr;
        let mut end = addr + len;

        // Merge with the hole that ends exactly where this range starts.
        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
            }
        }
        // Merge with the hole that starts exactly where this range ends.
        if let Some(next_len) = self.free.remove(&end) {
            end += next_len;
        }

        self.free.insert(start, end - start);
        Some(len)
    }
}

// ---------------------------------------------------------------------------
// MemoryManager
// ---------------------------------------------------------------------------

/// Allocator over all banks of one device.
#[derive(Debug)]
pub struct MemoryManager {
    banks: Vec<Bank>,
}

impl MemoryManager {
    pub fn new(banks: &[BankConfig]) -> Self {
        Self {
            banks: banks
                .iter()
                .map(|b| Bank::new(&b.tag, b.base, b.size))
                .collect(),
        }
    }

    pub fn banks(&self) -> &[Bank] {
        &self.banks
    }

    /// Allocate `size` bytes and return the device address.
    ///
    /// With `bank = None` banks are tried in order, default bank (index 0) first.
    /// A zero-byte request is served as one page.
    pub fn allocate(&mut self, size: u64, bank: Option<usize>) -> ShimResult<u64> {
        let size = align_up(size.max(1), ALIGNMENT).ok_or(ShimError::OutOfMemory)?;

        match bank {
            Some(idx) => {
                let bank = self.banks.get_mut(idx).ok_or_else(|| {
                    ShimError::NotFound(format!("memory bank {idx}"))
                })?;
                bank.allocate(size).ok_or(ShimError::OutOfMemory)
            }
            None => self
                .banks
                .iter_mut()
                .find_map(|b| b.allocate(size))
                .ok_or(ShimError::OutOfMemory),
        }
    }

    /// Return the range starting at `addr` to its bank. Returns the released length.
    pub fn release(&mut self, addr: u64) -> Option<u64> {
        self.banks
            .iter_mut()
            .find(|b| b.contains(addr))
            .and_then(|b| b.release(addr))
    }

    /// Index of the bank owning `addr`.
    pub fn bank_of(&self, addr: u64) -> Option<usize> {
        self.banks.iter().position(|b| b.contains(addr))
    }

    /// Total bytes allocated across banks.
    pub fn used(&self) -> u64 {
        self.banks.iter().map(Bank::used).sum()
    }
}
