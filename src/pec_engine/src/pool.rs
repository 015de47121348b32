/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! DMA pool allocator.
//!
//! Bounce buffers and engine-owned buffers are carved from one fixed region of
//! DMA-visible memory handed to the engine at construction time. The region is
//! managed in two layers:
//!
//! - [`Slab`] - a fixed-size region allocator with a power-of-two slot size `N`,
//!   backed by a flat bitmap (`FixedBitSet`).
//! - [`BufferPool`] - a two-tier pool composing two slabs: small slots for
//!   auxiliary tokens and security contexts, page-sized slots for packet
//!   bounce buffers.
//!
//! # Algorithm
//!
//! Allocation is a linear scan for the first run of free bits long enough for
//! the request, using `fixedbitset`'s word-level iteration over zero bits.
//! The most recently freed run is cached and handed out first, so a bounce
//! buffer released by the completion path is typically reused by the next
//! submission of the same size.
//!
//! Every slot size is a power of two and slabs are aligned to their slot size,
//! so every allocation is aligned to at least `L` bytes.
//!
//! The pool has no interior locking. Its single owner, the
//! [`DmaArena`](crate::dmabuf::DmaArena), serializes access.

use fixedbitset::FixedBitSet;
use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Invalid region addr {0}")]
    InvalidAlign(u64),
    #[error("Invalid free addr {0} and size {1}")]
    InvalidFree(u64, usize),
    #[error("Invalid argument")]
    InvalidArg,
    #[error("Empty region")]
    EmptyRegion,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Overflow")]
    Overflow,
}

/// Allocation result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Starting bus address of the allocation
    pub addr: u64,
    /// Length of the allocation in bytes rounded up to slab size
    pub len: usize,
}

/// A guard that runs a cleanup function when dropped, unless dismissed.
///
/// Used on multi-step paths (allocate, copy in, link) so that an early `?`
/// return hands the allocation back to the pool.
pub struct AllocGuard<F: FnOnce(Allocation)>(Option<(Allocation, F)>);

impl<F: FnOnce(Allocation)> AllocGuard<F> {
    pub fn new(alloc: Allocation, cleanup: F) -> Self {
        Self(Some((alloc, cleanup)))
    }

    /// Keep the allocation and skip the cleanup.
    pub fn dismiss(mut self) -> Allocation {
        match self.0.take() {
            Some((alloc, _)) => alloc,
            None => unreachable!("AllocGuard dismissed twice"),
        }
    }

    /// The guarded allocation.
    pub fn allocation(&self) -> Allocation {
        match &self.0 {
            Some((alloc, _)) => *alloc,
            None => unreachable!("AllocGuard used after dismiss"),
        }
    }
}

impl<F: FnOnce(Allocation)> Drop for AllocGuard<F> {
    fn drop(&mut self) {
        if let Some((alloc, cleanup)) = self.0.take() {
            cleanup(alloc)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Slab<const N: usize> {
    /// Base address of the slab
    base_addr: u64,
    /// Flat bitmap to track allocated/free slots
    used_slots: FixedBitSet,
    /// Last free allocation cache
    last_free_run: Option<Allocation>,
}

impl<const N: usize> Slab<N> {
    /// Create a new slab allocator over a fixed region.
    /// Region is rounded down to a multiple of N.
    pub fn new(base_addr: u64, region_len: usize) -> Result<Self, AllocError> {
        if base_addr % (N as u64) != 0 {
            return Err(AllocError::InvalidAlign(base_addr));
        }

        let num_slots = region_len / N;
        if num_slots == 0 {
            return Err(AllocError::EmptyRegion);
        }

        Ok(Self {
            base_addr,
            used_slots: FixedBitSet::with_capacity(num_slots),
            last_free_run: None,
        })
    }

    #[inline]
    fn addr_of(&self, slot_idx: usize) -> Option<u64> {
        self.base_addr
            .checked_add((slot_idx as u64).checked_mul(N as u64)?)
    }

    #[inline]
    fn slot_of(&self, addr: u64) -> usize {
        ((addr - self.base_addr) as usize) / N
    }

    /// Drop the cached free run if `alloc` overlaps it.
    fn maybe_invalidate_last_run(&mut self, alloc: Allocation) {
        if let Some(run) = &self.last_free_run {
            let new_end = alloc.addr + alloc.len as u64;
            let run_end = run.addr + run.len as u64;

            if alloc.addr < run_end && run.addr < new_end {
                self.last_free_run = None;
            }
        }
    }

    /// Find the first index of `slots_num` consecutive free slots.
    fn find_slots(&mut self, slots_num: usize) -> Option<usize> {
        debug_assert!(slots_num > 0);

        if let Some(run) = self.last_free_run
            && run.len >= slots_num * N
        {
            self.last_free_run = None;
            return Some(self.slot_of(run.addr));
        }

        let total = self.used_slots.len();
        self.used_slots.zeroes().find(|&next_free| {
            next_free + slots_num <= total
                && self
                    .used_slots
                    .count_zeroes(next_free..next_free + slots_num)
                    == slots_num
        })
    }

    /// Allocate at least `len` bytes by merging consecutive slots.
    pub fn alloc(&mut self, len: usize) -> Result<Allocation, AllocError> {
        if len == 0 {
            return Err(AllocError::InvalidArg);
        }

        let need_slots = len.div_ceil(N);
        if need_slots > self.used_slots.len() {
            return Err(AllocError::OutOfMemory);
        }

        let idx = self.find_slots(need_slots).ok_or(AllocError::OutOfMemory)?;
        let addr = self.addr_of(idx).ok_or(AllocError::Overflow)?;
        self.used_slots.insert_range(idx..idx + need_slots);

        let alloc = Allocation {
            addr,
            len: need_slots * N,
        };

        self.maybe_invalidate_last_run(alloc);
        Ok(alloc)
    }

    /// Free a previously allocated run of slots.
    ///
    /// `len` must be a multiple of N and `addr` must be N-aligned to base.
    pub fn dealloc(&mut self, alloc: Allocation) -> Result<(), AllocError> {
        let Allocation { addr, len } = alloc;
        if len == 0 || len % N != 0 || addr < self.base_addr {
            return Err(AllocError::InvalidFree(addr, len));
        }

        let off = (addr - self.base_addr) as usize;
        if off % N != 0 {
            return Err(AllocError::InvalidFree(addr, len));
        }

        let start = off / N;
        let alloc_slots = len / N;
        if start + alloc_slots > self.used_slots.len() {
            return Err(AllocError::InvalidFree(addr, len));
        }

        // every slot must be in use, otherwise this is a double free
        if !self
            .used_slots
            .contains_all_in_range(start..start + alloc_slots)
        {
            return Err(AllocError::InvalidFree(addr, len));
        }

        self.used_slots.remove_range(start..start + alloc_slots);
        self.last_free_run = Some(alloc);

        Ok(())
    }

    /// Number of free bytes in the slab.
    pub fn free_bytes(&self) -> usize {
        (self.used_slots.len() - self.used_slots.count_ones(..)) * N
    }

    /// Total capacity of the slab in bytes.
    pub fn capacity(&self) -> usize {
        self.used_slots.len() * N
    }

    /// Address range covered by this slab.
    pub fn range(&self) -> core::ops::Range<u64> {
        self.base_addr..self.base_addr + self.capacity() as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.range().contains(&addr)
    }

    pub const fn slot_size() -> usize {
        N
    }
}

#[inline]
fn align_up(val: u64, align: usize) -> u64 {
    debug_assert!(align.is_power_of_two());
    let mask = align as u64 - 1;
    (val + mask) & !mask
}

/// Two tier DMA pool with small and large slabs.
#[derive(Debug, Clone)]
pub struct BufferPool<const L: usize = 256, const U: usize = 4096> {
    lower: Slab<L>,
    upper: Slab<U>,
}

impl<const L: usize, const U: usize> BufferPool<L, U> {
    /// Fraction of the region given to the small-slot tier.
    const LOWER_FRACTION: usize = 8;

    /// Create a new pool over the region `[base_addr, base_addr + region_len)`.
    pub fn new(base_addr: u64, region_len: usize) -> Result<Self, AllocError> {
        let end = base_addr
            .checked_add(region_len as u64)
            .ok_or(AllocError::Overflow)?;

        let lower_base = align_up(base_addr, L);
        let lower_len = region_len / Self::LOWER_FRACTION;
        let lower = Slab::<L>::new(lower_base, lower_len)?;

        let upper_base = align_up(lower.range().end, U);
        let upper_len = end.saturating_sub(upper_base) as usize;
        let upper = Slab::<U>::new(upper_base, upper_len)?;

        Ok(Self { lower, upper })
    }

    /// Allocate at least `len` bytes.
    ///
    /// Requests up to `L` bytes try the small tier first and fall back to the
    /// large tier when it is exhausted.
    pub fn alloc(&mut self, len: usize) -> Result<Allocation, AllocError> {
        if len <= L {
            match self.lower.alloc(len) {
                Ok(alloc) => return Ok(alloc),
                Err(AllocError::OutOfMemory) => {}
                Err(e) => return Err(e),
            }
        }

        self.upper.alloc(len)
    }

    /// Free a previously allocated block.
    pub fn dealloc(&mut self, alloc: Allocation) -> Result<(), AllocError> {
        if self.lower.contains(alloc.addr) {
            self.lower.dealloc(alloc)
        } else {
            self.upper.dealloc(alloc)
        }
    }

    /// Free bytes over both tiers.
    pub fn free_bytes(&self) -> usize {
        self.lower.free_bytes() + self.upper.free_bytes()
    }

    /// Total bytes over both tiers.
    pub fn capacity(&self) -> usize {
        self.lower.capacity() + self.upper.capacity()
    }

    /// Whether `addr` lies inside memory managed by this pool.
    pub fn contains(&self, addr: u64) -> bool {
        self.lower.contains(addr) || self.upper.contains(addr)
    }

    /// Smallest alignment every allocation satisfies.
    pub const fn alignment() -> usize {
        L
    }
}


#[cfg(test)]
mod fuzz {
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::*;

    const MAX_OPS: usize = 32;
    const MAX_ALLOC_SIZE: usize = 8192;

    #[derive(Clone, Debug)]
    enum Op {
        Alloc(usize),
        Dealloc(usize),
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            if bool::arbitrary(g) {
                Op::Alloc(usize::arbitrary(g) % MAX_ALLOC_SIZE + 1)
            } else {
                Op::Dealloc(usize::arbitrary(g))
            }
        }
    }

    #[derive(Clone, Debug)]
    struct Scenario {
        pool_size: usize,
        ops: Vec<Op>,
    }

    impl Arbitrary for Scenario {
        fn arbitrary(g: &mut Gen) -> Self {
            let pool_size = (usize::arbitrary(g) % (256 * 1024)) + (64 * 1024);
            let num_ops = usize::arbitrary(g) % MAX_OPS + 1;
            let ops = (0..num_ops).map(|_| Op::arbitrary(g)).collect();

            Scenario { pool_size, ops }
        }
    }

    fn overlaps(a: &Allocation, b: &Allocation) -> bool {
        a.addr < b.addr + b.len as u64 && b.addr < a.addr + a.len as u64
    }

    fn run_scenario(s: Scenario) -> bool {
        let mut pool = match BufferPool::<256, 4096>::new(0x10000, s.pool_size) {
            Ok(p) => p,
            Err(_) => return true,
        };
        let initial = pool.free_bytes();
        let mut live: Vec<Allocation> = Vec::new();

        for op in &s.ops {
            match op {
                Op::Alloc(size) => match pool.alloc(*size) {
                    Ok(alloc) => {
                        if alloc.len < *size || !pool.contains(alloc.addr) {
                            return false;
                        }
                        if live.iter().any(|other| overlaps(other, &alloc)) {
                            return false;
                        }
                        live.push(alloc);
                    }
                    Err(AllocError::OutOfMemory) => {}
                    Err(_) => return false,
                },
                Op::Dealloc(idx) => {
                    if live.is_empty() {
                        continue;
                    }
                    let alloc = live.swap_remove(idx % live.len());
                    if pool.dealloc(alloc).is_err() {
                        return false;
                    }
                }
            }

            let used: usize = live.iter().map(|a| a.len).sum();
            if pool.free_bytes() + used != initial {
                return false;
            }
        }

        live.drain(..).all(|a| pool.dealloc(a).is_ok()) && pool.free_bytes() == initial
    }

    #[test]
    fn prop_pool_allocations_never_overlap() {
        #[cfg(miri)]
        let tests = 10;
        #[cfg(not(miri))]
        let tests = 1000;

        QuickCheck::new()
            .tests(tests)
            .quickcheck(run_scenario as fn(Scenario) -> bool);
    }
}
