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

//! DMA buffer handles.
//!
//! Every region the engine hands to the accelerator is described by a record
//! in a [`DmaArena`] and referred to by a [`BufferHandle`]. Records are kept in
//! a slot vector addressed by index; each slot carries a generation counter so
//! a handle to a released record is rejected instead of aliasing whatever
//! record reuses the slot.
//!
//! A record is one of:
//!
//! - a pool allocation made by [`DmaArena::alloc`] (always accessible),
//! - caller memory wrapped by [`DmaArena::register`], which may be
//!   [`Accessibility::Foreign`]: not addressable by the device,
//! - a scatter/gather list created by [`DmaArena::sg_create`], holding
//!   particle handles rather than memory.
//!
//! A record owns at most one bounce companion (`bounce`). The bounce manager
//! in [`crate::bounce`] attaches and detaches it; releasing the record
//! releases the companion too.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};
use thiserror::Error;

use crate::error::PecErrorKind;
use crate::memory::DmaMemory;
use crate::pool::{AllocError, Allocation, BufferPool};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    #[error("Invalid or released buffer handle")]
    InvalidHandle,
    #[error("Zero sized buffer")]
    ZeroSize,
    #[error("Handle is not a scatter/gather list")]
    NotAnSgList,
    #[error("Scatter/gather list cannot hold a nested list")]
    NestedSgList,
    #[error("Particle index {0} out of range")]
    ParticleIndex(usize),
    #[error("Access of {len} bytes at offset {offset} is out of bounds")]
    OutOfBounds { offset: usize, len: usize },
    #[error("Buffer is already bounced")]
    AlreadyBounced,
    #[error("Pool allocation failed: {0}")]
    Alloc(#[from] AllocError),
    #[error("DMA memory access failed")]
    Memory,
}

impl DmaError {
    pub fn kind(&self) -> PecErrorKind {
        match self {
            DmaError::Alloc(AllocError::OutOfMemory) => PecErrorKind::ResourceExhausted,
            DmaError::Alloc(_) | DmaError::Memory => PecErrorKind::Internal,
            _ => PecErrorKind::InvalidArgument,
        }
    }
}

/// Opaque reference to a record in a [`DmaArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

/// Whether the device can address a registered region directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessibility {
    Accessible,
    Foreign,
}

/// One fragment of a scatter/gather list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Particle {
    pub handle: BufferHandle,
    pub byte_count: u32,
}

/// Snapshot of a record, as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub addr: u64,
    pub size: usize,
    pub accessible: bool,
    pub bounce: Option<BufferHandle>,
    /// Number of particles when the handle is a scatter/gather list, else 0.
    pub sg_capacity: usize,
}

#[derive(Debug)]
pub(crate) enum Backing {
    Pool(Allocation),
    Registered,
}

#[derive(Debug)]
pub(crate) struct BufferRecord {
    pub(crate) addr: u64,
    pub(crate) size: usize,
    pub(crate) accessible: bool,
    pub(crate) backing: Backing,
    pub(crate) bounce: Option<BufferHandle>,
    pub(crate) particles: Option<Vec<Option<Particle>>>,
}

impl BufferRecord {
    fn info(&self) -> BufferInfo {
        BufferInfo {
            addr: self.addr,
            size: self.size,
            accessible: self.accessible,
            bounce: self.bounce,
            sg_capacity: self.particles.as_ref().map_or(0, Vec::len),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    record: Option<BufferRecord>,
}

/// Lock-protected arena contents.
#[derive(Debug)]
pub(crate) struct ArenaState {
    slots: Vec<Slot>,
    free: Vec<u32>,
    pub(crate) pool: BufferPool,
    pub(crate) bounces: usize,
}

impl ArenaState {
    pub(crate) fn record(&self, handle: BufferHandle) -> Result<&BufferRecord, DmaError> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_ref())
            .ok_or(DmaError::InvalidHandle)
    }

    pub(crate) fn record_mut(
        &mut self,
        handle: BufferHandle,
    ) -> Result<&mut BufferRecord, DmaError> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_mut())
            .ok_or(DmaError::InvalidHandle)
    }

    pub(crate) fn insert(&mut self, record: BufferRecord) -> BufferHandle {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.record = Some(record);
                BufferHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    record: Some(record),
                });
                BufferHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Remove a record and return its pool memory. The bounce companion, if
    /// any, is left to the caller.
    pub(crate) fn remove(&mut self, handle: BufferHandle) -> Result<BufferRecord, DmaError> {
        self.record(handle)?;

        let slot = &mut self.slots[handle.index as usize];
        let record = slot.record.take().ok_or(DmaError::InvalidHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        if let Backing::Pool(alloc) = record.backing {
            self.pool.dealloc(alloc)?;
        }
        Ok(record)
    }

    pub(crate) fn alloc_record(&mut self, size: usize) -> Result<BufferHandle, DmaError> {
        if size == 0 {
            return Err(DmaError::ZeroSize);
        }
        let alloc = self.pool.alloc(size)?;
        Ok(self.insert(BufferRecord {
            addr: alloc.addr,
            size,
            accessible: true,
            backing: Backing::Pool(alloc),
            bounce: None,
            particles: None,
        }))
    }

    /// Address the device should use: the bounce companion's when attached.
    pub(crate) fn bus_address(&self, handle: BufferHandle) -> Result<u64, DmaError> {
        let record = self.record(handle)?;
        match record.bounce {
            Some(bounce) => Ok(self.record(bounce)?.addr),
            None => Ok(record.addr),
        }
    }

    fn live_records(&self) -> usize {
        self.slots.iter().filter(|s| s.record.is_some()).count()
    }
}

pub(crate) fn memory_error<E: core::fmt::Debug>(err: E) -> DmaError {
    log::error!("DMA memory access failed: {:?}", err);
    DmaError::Memory
}

/// Arena of DMA buffer records plus the pool bounce buffers come from.
///
/// All methods take `&self`; the arena serializes itself with a short spin
/// lock so the submission and completion paths can share it.
pub struct DmaArena<M: DmaMemory> {
    memory: Arc<M>,
    state: Mutex<ArenaState>,
}

impl<M: DmaMemory> core::fmt::Debug for DmaArena<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaArena").finish_non_exhaustive()
    }
}

impl<M: DmaMemory> DmaArena<M> {
    pub fn new(memory: Arc<M>, pool: BufferPool) -> Self {
        Self {
            memory,
            state: Mutex::new(ArenaState {
                slots: Vec::new(),
                free: Vec::new(),
                pool,
                bounces: 0,
            }),
        }
    }

    pub fn memory(&self) -> &Arc<M> {
        &self.memory
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ArenaState> {
        self.state.lock()
    }

    /// Allocate an accessible buffer of `size` bytes from the DMA pool.
    pub fn alloc(&self, size: usize) -> Result<BufferHandle, DmaError> {
        self.lock().alloc_record(size)
    }

    /// Wrap caller memory at bus address `addr`.
    pub fn register(
        &self,
        addr: u64,
        size: usize,
        access: Accessibility,
    ) -> Result<BufferHandle, DmaError> {
        Ok(self.lock().insert(BufferRecord {
            addr,
            size,
            accessible: access == Accessibility::Accessible,
            backing: Backing::Registered,
            bounce: None,
            particles: None,
        }))
    }

    /// Destroy a record together with its bounce companion.
    ///
    /// Particles of a scatter/gather list are not released.
    pub fn release(&self, handle: BufferHandle) -> Result<(), DmaError> {
        let mut state = self.lock();
        let record = state.remove(handle)?;
        if let Some(bounce) = record.bounce {
            log::warn!("releasing {:?} with a live bounce buffer", handle);
            state.remove(bounce)?;
            state.bounces -= 1;
        }
        Ok(())
    }

    pub fn info(&self, handle: BufferHandle) -> Result<BufferInfo, DmaError> {
        Ok(self.lock().record(handle)?.info())
    }

    pub fn bus_address(&self, handle: BufferHandle) -> Result<u64, DmaError> {
        self.lock().bus_address(handle)
    }

    /// Whether `inner` lies completely inside `outer`.
    pub fn is_sub_range_of(
        &self,
        inner: BufferHandle,
        outer: BufferHandle,
    ) -> Result<bool, DmaError> {
        let state = self.lock();
        let inner = state.record(inner)?;
        let outer = state.record(outer)?;

        let inner_end = inner.addr + inner.size as u64;
        let outer_end = outer.addr + outer.size as u64;
        Ok(inner.addr >= outer.addr && inner_end <= outer_end)
    }

    /// Host-side read of the buffer's own memory (never the bounce companion).
    pub fn read(&self, handle: BufferHandle, offset: usize, dst: &mut [u8]) -> Result<(), DmaError> {
        let addr = self.checked_range(handle, offset, dst.len())?;
        self.memory.read(addr, dst).map_err(memory_error)?;
        Ok(())
    }

    /// Host-side write of the buffer's own memory.
    pub fn write(&self, handle: BufferHandle, offset: usize, src: &[u8]) -> Result<(), DmaError> {
        let addr = self.checked_range(handle, offset, src.len())?;
        self.memory.write(addr, src).map_err(memory_error)?;
        Ok(())
    }

    fn checked_range(&self, handle: BufferHandle, offset: usize, len: usize) -> Result<u64, DmaError> {
        let state = self.lock();
        let record = state.record(handle)?;
        match offset.checked_add(len) {
            Some(end) if end <= record.size => Ok(record.addr + offset as u64),
            _ => Err(DmaError::OutOfBounds { offset, len }),
        }
    }

    /// Flush the device-visible range of `handle` before a transfer.
    pub(crate) fn sync_for_device(&self, handle: BufferHandle) -> Result<(), DmaError> {
        let (addr, len) = self.device_range(handle)?;
        self.memory.sync_for_device(addr, len).map_err(memory_error)
    }

    /// Invalidate the device-visible range of `handle` after a transfer.
    pub(crate) fn sync_for_host(&self, handle: BufferHandle) -> Result<(), DmaError> {
        let (addr, len) = self.device_range(handle)?;
        self.memory.sync_for_host(addr, len).map_err(memory_error)
    }

    fn device_range(&self, handle: BufferHandle) -> Result<(u64, usize), DmaError> {
        let state = self.lock();
        let record = state.record(handle)?;
        match record.bounce {
            Some(bounce) => {
                let bounce = state.record(bounce)?;
                Ok((bounce.addr, bounce.size))
            }
            None => Ok((record.addr, record.size)),
        }
    }

    /// Create an empty scatter/gather list able to hold `capacity` particles.
    pub fn sg_create(&self, capacity: usize) -> Result<BufferHandle, DmaError> {
        if capacity == 0 {
            return Err(DmaError::ZeroSize);
        }
        Ok(self.lock().insert(BufferRecord {
            addr: 0,
            size: 0,
            accessible: true,
            backing: Backing::Registered,
            bounce: None,
            particles: Some(vec![None; capacity]),
        }))
    }

    /// Set particle `index` of `list`.
    pub fn sg_write(
        &self,
        list: BufferHandle,
        index: usize,
        particle: BufferHandle,
        byte_count: u32,
    ) -> Result<(), DmaError> {
        let mut state = self.lock();
        if state.record(particle)?.particles.is_some() {
            return Err(DmaError::NestedSgList);
        }

        let particles = state
            .record_mut(list)?
            .particles
            .as_mut()
            .ok_or(DmaError::NotAnSgList)?;
        let entry = particles
            .get_mut(index)
            .ok_or(DmaError::ParticleIndex(index))?;
        *entry = Some(Particle {
            handle: particle,
            byte_count,
        });
        Ok(())
    }

    /// Read particle `index` of `list`. `None` if it was never written.
    pub fn sg_read(&self, list: BufferHandle, index: usize) -> Result<Option<Particle>, DmaError> {
        let state = self.lock();
        let particles = state
            .record(list)?
            .particles
            .as_ref()
            .ok_or(DmaError::NotAnSgList)?;
        particles
            .get(index)
            .copied()
            .ok_or(DmaError::ParticleIndex(index))
    }

    /// Particle capacity of `handle`; 0 for plain buffers and stale handles.
    pub fn sg_capacity(&self, handle: BufferHandle) -> usize {
        self.lock()
            .record(handle)
            .map_or(0, |record| record.particles.as_ref().map_or(0, Vec::len))
    }

    /// Destroy a scatter/gather list. The particles stay registered.
    pub fn sg_destroy(&self, list: BufferHandle) -> Result<(), DmaError> {
        let mut state = self.lock();
        if state.record(list)?.particles.is_none() {
            return Err(DmaError::NotAnSgList);
        }
        state.remove(list)?;
        Ok(())
    }

    /// Free bytes left in the DMA pool.
    pub fn pool_free_bytes(&self) -> usize {
        self.lock().pool.free_bytes()
    }

    /// Number of bounce buffers currently attached to some record.
    pub fn outstanding_bounces(&self) -> usize {
        self.lock().bounces
    }

    /// Number of live records, bounce buffers included.
    pub fn live_records(&self) -> usize {
        self.lock().live_records()
    }
}
