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

//! Bounce buffer manager.
//!
//! The accelerator can only reach memory it can address. When a request names
//! a [foreign](crate::dmabuf::Accessibility::Foreign) buffer, the engine
//! copies it into an accessible bounce buffer from the DMA pool, links the
//! bounce buffer to the original record and lets the device work on the
//! copy. After completion the copy is written back and released.
//!
//! Rules:
//!
//! - Accessible and zero sized buffers are used as they are.
//! - The source and destination of one packet share a single bounce buffer
//!   sized for the larger of the two. The source bytes are copied in; the
//!   destination receives the result on [`restore_pair`](DmaArena::restore_pair).
//! - A buffer can be linked to one bounce buffer at a time.
//! - Rollback uses the `discard*` variants: the bounce buffer is released
//!   without writing anything back.
//!
//! Allocation happens before any link is made, so a failed allocation leaves
//! every record untouched.

use crate::dmabuf::{ArenaState, Backing, BufferHandle, BufferRecord, DmaArena, DmaError, memory_error};
use crate::memory::DmaMemory;
use crate::pool::AllocGuard;

impl<M: DmaMemory> DmaArena<M> {
    /// Make `handle` addressable by the device.
    ///
    /// Returns `handle` itself when no copy is needed, otherwise the handle of
    /// the freshly linked bounce buffer.
    pub fn ensure_accessible(&self, handle: BufferHandle) -> Result<BufferHandle, DmaError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let record = state.record(handle)?;
        if record.accessible || record.size == 0 {
            return Ok(handle);
        }
        if record.bounce.is_some() {
            return Err(DmaError::AlreadyBounced);
        }

        let (addr, size) = (record.addr, record.size);
        self.bounce_in(state, &[handle], addr, size, size)
    }

    /// Make a packet's source and destination addressable by the device.
    ///
    /// If either side is foreign, both are linked to one bounce buffer of
    /// `max(src, dst)` bytes holding a copy of the source. Returns the bounce
    /// handle, or `None` when both sides are used directly.
    pub fn ensure_accessible_pair(
        &self,
        src: BufferHandle,
        dst: BufferHandle,
    ) -> Result<Option<BufferHandle>, DmaError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let s = state.record(src)?;
        let d = state.record(dst)?;
        if s.accessible && d.accessible {
            return Ok(None);
        }
        if s.bounce.is_some() || d.bounce.is_some() {
            return Err(DmaError::AlreadyBounced);
        }

        let size = s.size.max(d.size);
        if size == 0 {
            return Ok(None);
        }

        let (src_addr, src_size) = (s.addr, s.size);
        let bounce = if src == dst {
            self.bounce_in(state, &[src], src_addr, src_size, size)?
        } else {
            self.bounce_in(state, &[src, dst], src_addr, src_size, size)?
        };
        Ok(Some(bounce))
    }

    /// Copy the bounce contents back into `handle` and release the bounce
    /// buffer. No-op if `handle` is not bounced.
    pub fn restore(&self, handle: BufferHandle) -> Result<(), DmaError> {
        let mut state = self.lock();
        self.unlink(&mut state, handle, true)
    }

    /// [`restore`](Self::restore) for a packet bounced with
    /// [`ensure_accessible_pair`](Self::ensure_accessible_pair): the result is
    /// written into `dst` and the source link is dropped.
    pub fn restore_pair(&self, src: Option<BufferHandle>, dst: BufferHandle) -> Result<(), DmaError> {
        let mut state = self.lock();
        let shared = state.record(dst)?.bounce;
        self.unlink(&mut state, dst, true)?;
        Self::forget_shared(&mut state, src, dst, shared)
    }

    /// Release the bounce buffer of `handle` without copying anything back.
    pub fn discard(&self, handle: BufferHandle) -> Result<(), DmaError> {
        let mut state = self.lock();
        self.unlink(&mut state, handle, false)
    }

    /// [`discard`](Self::discard) for a packet pair.
    pub fn discard_pair(&self, src: Option<BufferHandle>, dst: BufferHandle) -> Result<(), DmaError> {
        let mut state = self.lock();
        let shared = state.record(dst)?.bounce;
        self.unlink(&mut state, dst, false)?;
        Self::forget_shared(&mut state, src, dst, shared)
    }

    fn forget_shared(
        state: &mut ArenaState,
        src: Option<BufferHandle>,
        dst: BufferHandle,
        shared: Option<BufferHandle>,
    ) -> Result<(), DmaError> {
        let Some(src) = src.filter(|&src| src != dst) else {
            return Ok(());
        };
        let record = state.record_mut(src)?;
        if shared.is_some() && record.bounce == shared {
            record.bounce = None;
        }
        Ok(())
    }

    fn bounce_in(
        &self,
        state: &mut ArenaState,
        owners: &[BufferHandle],
        src_addr: u64,
        copy_len: usize,
        size: usize,
    ) -> Result<BufferHandle, DmaError> {
        let pool = &mut state.pool;
        let alloc = pool.alloc(size)?;
        let guard = AllocGuard::new(alloc, |a| {
            let _ = pool.dealloc(a);
        });

        if copy_len > 0 {
            self.memory()
                .copy(src_addr, alloc.addr, copy_len)
                .map_err(memory_error)?;
        }
        let alloc = guard.dismiss();

        let bounce = state.insert(BufferRecord {
            addr: alloc.addr,
            size,
            accessible: true,
            backing: Backing::Pool(alloc),
            bounce: None,
            particles: None,
        });
        for &owner in owners {
            state.record_mut(owner)?.bounce = Some(bounce);
        }
        state.bounces += 1;
        Ok(bounce)
    }

    fn unlink(
        &self,
        state: &mut ArenaState,
        handle: BufferHandle,
        write_back: bool,
    ) -> Result<(), DmaError> {
        let record = state.record(handle)?;
        let Some(bounce) = record.bounce else {
            return Ok(());
        };
        let (addr, size) = (record.addr, record.size);

        if write_back && size > 0 {
            let from = state.record(bounce)?.addr;
            let memory = self.memory();
            memory.sync_for_host(from, size).map_err(memory_error)?;
            memory.copy(from, addr, size).map_err(memory_error)?;
        }

        state.record_mut(handle)?.bounce = None;
        state.remove(bounce)?;
        state.bounces -= 1;
        Ok(())
    }
}
