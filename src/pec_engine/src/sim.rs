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

//! Simulated DMA memory and ring backend.
//!
//! [`SimMemory`] is a flat byte array standing in for bus-addressable memory.
//! [`SimBackend`] keeps its command and result rings inside that memory as
//! [`CommandSegment`]/[`ResultSegment`] records and plays the device: calling
//! [`SimBackend::process`] reads pending commands back from ring memory,
//! gathers the input fragments, applies a byte transform and scatters the
//! output into the destination fragments, producing processed result segments
//! with output tokens.
//!
//! Besides the device behavior it has knobs for the situations a real device
//! produces only occasionally: a capped free space report, a late rejection
//! of part of a batch, an injected error code and results that become visible
//! one segment at a time.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use smallvec::SmallVec;
use spin::Mutex;
use thiserror::Error;

use crate::backend::{
    BackendError, Capabilities, InterruptHandler, InterruptSource, RingBackend, RingFeatures,
    RingId, SupportedFuncs,
};
use crate::config::RingConfig;
use crate::descriptor::{
    CommandSegment, ContextAddresses, OutputToken, PreparedRequest, ProcessedSegment,
    ResultSegment, SegmentFlags, control_word,
};
use crate::memory::DmaMemory;
use crate::status::StatusMap;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("address {addr:#x} + {len} outside simulated memory")]
pub struct SimMemoryError {
    pub addr: u64,
    pub len: usize,
}

/// Byte-addressable memory covering `[base, base + len)`.
pub struct SimMemory {
    base: u64,
    bytes: Mutex<Vec<u8>>,
    device_syncs: AtomicUsize,
    host_syncs: AtomicUsize,
}

impl core::fmt::Debug for SimMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimMemory")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl SimMemory {
    pub fn new(base: u64, len: usize) -> Self {
        Self {
            base,
            bytes: Mutex::new(vec![0; len]),
            device_syncs: AtomicUsize::new(0),
            host_syncs: AtomicUsize::new(0),
        }
    }

    fn offset(&self, addr: u64, len: usize, total: usize) -> Result<usize, SimMemoryError> {
        let err = SimMemoryError { addr, len };
        let off = addr.checked_sub(self.base).ok_or(err)? as usize;
        match off.checked_add(len) {
            Some(end) if end <= total => Ok(off),
            _ => Err(err),
        }
    }

    /// Number of `sync_for_device` calls so far.
    pub fn device_syncs(&self) -> usize {
        self.device_syncs.load(Ordering::Relaxed)
    }

    /// Number of `sync_for_host` calls so far.
    pub fn host_syncs(&self) -> usize {
        self.host_syncs.load(Ordering::Relaxed)
    }
}

impl DmaMemory for SimMemory {
    type Error = SimMemoryError;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        let bytes = self.bytes.lock();
        let off = self.offset(addr, dst.len(), bytes.len())?;
        dst.copy_from_slice(&bytes[off..off + dst.len()]);
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        let mut bytes = self.bytes.lock();
        let off = self.offset(addr, src.len(), bytes.len())?;
        bytes[off..off + src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn sync_for_device(&self, _addr: u64, _len: usize) -> Result<(), Self::Error> {
        self.device_syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sync_for_host(&self, _addr: u64, _len: usize) -> Result<(), Self::Error> {
        self.host_syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Bitwise inversion, the default simulated transform.
pub fn invert(bytes: &mut [u8]) {
    bytes.iter_mut().for_each(|b| *b = !*b);
}

/// Shape of a simulated device.
#[derive(Clone, Copy, Debug)]
pub struct SimConfig {
    /// Bus address of the command ring; the result ring follows it.
    pub ring_base: u64,
    pub command_capacity: usize,
    pub result_capacity: usize,
    pub max_logical_descriptors: usize,
    pub max_packets: usize,
    pub separate_rings: bool,
    pub scatter_gather: bool,
    pub interrupts: bool,
    /// Applied to the gathered input of every packet.
    pub transform: fn(&mut [u8]),
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ring_base: 0x1_0000,
            command_capacity: 32,
            result_capacity: 32,
            max_logical_descriptors: 32,
            max_packets: 32,
            separate_rings: true,
            scatter_gather: true,
            interrupts: true,
            transform: invert,
        }
    }
}

impl SimConfig {
    fn result_base(&self) -> u64 {
        self.ring_base + (self.command_capacity * CommandSegment::SIZE) as u64
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingPacket {
    cmd_slot: usize,
    cmd_count: usize,
    res_slot: usize,
    res_count: usize,
}

#[derive(Default)]
struct SimState {
    initialized: bool,
    ring_config: RingConfig,
    cmd_write: usize,
    res_write: usize,
    pending: VecDeque<PendingPacket>,
    /// Preloaded fragments, continuous scatter mode only.
    preloaded: VecDeque<ResultSegment>,
    /// Finished by the device but not yet visible to the host.
    done: VecDeque<ProcessedSegment>,
    /// Visible to the host.
    processed: VecDeque<ProcessedSegment>,
    free_override: Option<usize>,
    accept_limit: Option<usize>,
    fail_next_submit: bool,
    next_error: Option<u32>,
    enabled: [Option<usize>; 2],
    submitted: Vec<PreparedRequest>,
    contexts: Vec<ContextAddresses>,
}

fn source_index(source: InterruptSource) -> usize {
    match source {
        InterruptSource::Command => 0,
        InterruptSource::Result => 1,
    }
}

fn memory_error<E: core::fmt::Debug>(err: E) -> BackendError {
    log::error!("simulated ring memory access failed: {:?}", err);
    BackendError::Memory
}

/// Simulated command/result ring pair.
pub struct SimBackend<M: DmaMemory> {
    memory: Arc<M>,
    config: SimConfig,
    state: Mutex<SimState>,
    handlers: Mutex<[Option<InterruptHandler>; 2]>,
}

impl<M: DmaMemory> core::fmt::Debug for SimBackend<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<M: DmaMemory> SimBackend<M> {
    pub fn new(memory: Arc<M>, config: SimConfig) -> Self {
        Self {
            memory,
            config,
            state: Mutex::new(SimState::default()),
            handlers: Mutex::new([None, None]),
        }
    }

    fn free_in(&self, st: &SimState, ring: RingId) -> usize {
        let cmd_used: usize = st.pending.iter().map(|p| p.cmd_count).sum();
        let res_used: usize = st.pending.iter().map(|p| p.res_count).sum::<usize>()
            + st.preloaded.len()
            + st.done.len()
            + st.processed.len();

        let free = if self.config.separate_rings {
            match ring {
                RingId::Command => self.config.command_capacity.saturating_sub(cmd_used),
                RingId::Result => self.config.result_capacity.saturating_sub(res_used),
            }
        } else {
            self.config
                .command_capacity
                .saturating_sub(cmd_used.max(res_used))
        };

        match st.free_override {
            Some(cap) => free.min(cap),
            None => free,
        }
    }

    fn cmd_addr(&self, slot: usize) -> u64 {
        self.config.ring_base + ((slot % self.config.command_capacity) * CommandSegment::SIZE) as u64
    }

    fn res_addr(&self, slot: usize) -> u64 {
        self.config.result_base() + ((slot % self.config.result_capacity) * ResultSegment::SIZE) as u64
    }

    /// Cap what [`free_space`](RingBackend::free_space) reports.
    pub fn set_free_override(&self, cap: Option<usize>) {
        self.state.lock().free_override = cap;
    }

    /// Accept at most `limit` requests in the next submit call.
    pub fn set_accept_limit(&self, limit: usize) {
        self.state.lock().accept_limit = Some(limit);
    }

    /// Fail the next submit call outright.
    pub fn fail_next_submit(&self) {
        self.state.lock().fail_next_submit = true;
    }

    /// Report `error_code` in the output token of the next processed packet.
    pub fn inject_error(&self, error_code: u32) {
        self.state.lock().next_error = Some(error_code);
    }

    /// Every request accepted so far.
    pub fn submitted(&self) -> Vec<PreparedRequest> {
        self.state.lock().submitted.clone()
    }

    /// Security contexts currently known to the device.
    pub fn contexts(&self) -> Vec<ContextAddresses> {
        self.state.lock().contexts.clone()
    }

    /// Packets written to the rings and not yet processed.
    pub fn pending_packets(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Preloaded fragments not yet used.
    pub fn preloaded_fragments(&self) -> usize {
        self.state.lock().preloaded.len()
    }

    pub fn interrupt_threshold(&self, source: InterruptSource) -> Option<usize> {
        self.state.lock().enabled[source_index(source)]
    }

    pub fn has_handler(&self, source: InterruptSource) -> bool {
        self.handlers.lock()[source_index(source)].is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Process up to `packets` pending packets and make all of their result
    /// segments visible. Returns how many packets were processed.
    pub fn process(&self, packets: usize) -> Result<usize, BackendError> {
        let completed = {
            let mut st = self.state.lock();
            let mut completed = 0;
            while completed < packets && self.complete_one(&mut st)? {
                completed += 1;
            }
            let done: Vec<_> = st.done.drain(..).collect();
            st.processed.extend(done);
            completed
        };

        self.raise_pending_interrupts();
        Ok(completed)
    }

    /// Make exactly `segments` more result segments visible, processing
    /// packets as needed. Returns how many became visible.
    pub fn process_segments(&self, segments: usize) -> Result<usize, BackendError> {
        let revealed = {
            let mut st = self.state.lock();
            while st.done.len() < segments && self.complete_one(&mut st)? {}
            let n = segments.min(st.done.len());
            let done: Vec<_> = st.done.drain(..n).collect();
            st.processed.extend(done);
            n
        };

        self.raise_pending_interrupts();
        Ok(revealed)
    }

    /// Invoke the handler of `source` regardless of its threshold.
    pub fn raise(&self, source: InterruptSource) {
        let handler = self.handlers.lock()[source_index(source)].clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn raise_pending_interrupts(&self) {
        let mut fire: SmallVec<[InterruptSource; 2]> = SmallVec::new();
        {
            let st = self.state.lock();
            if let Some(threshold) = st.enabled[0]
                && self.free_in(&st, RingId::Command) >= threshold
            {
                fire.push(InterruptSource::Command);
            }
            if let Some(threshold) = st.enabled[1]
                && Self::count_packets(&st.processed) >= threshold
            {
                fire.push(InterruptSource::Result);
            }
        }

        for source in fire {
            self.raise(source);
        }
    }

    fn count_packets(segments: &VecDeque<ProcessedSegment>) -> usize {
        segments.iter().filter(|s| s.is_last()).count()
    }

    /// Run the oldest pending packet through the transform. Returns false if
    /// nothing could be processed.
    fn complete_one(&self, st: &mut SimState) -> Result<bool, BackendError> {
        let Some(packet) = st.pending.front().copied() else {
            return Ok(false);
        };
        let continuous = st.ring_config.continuous_scatter();

        let mut commands: SmallVec<[CommandSegment; 4]> = SmallVec::new();
        for i in 0..packet.cmd_count {
            let seg = self
                .memory
                .read_val::<CommandSegment>(self.cmd_addr(packet.cmd_slot + i))
                .map_err(memory_error)?;
            commands.push(seg);
        }

        let mut data = Vec::new();
        for seg in &commands {
            let len = seg.byte_count() as usize;
            if len > 0 {
                let start = data.len();
                data.resize(start + len, 0);
                self.memory
                    .read(seg.src_addr, &mut data[start..])
                    .map_err(memory_error)?;
            }
        }
        (self.config.transform)(&mut data);

        let fragments: SmallVec<[ResultSegment; 4]> = if continuous {
            let mut needed = 0;
            let mut room = 0usize;
            for frag in st.preloaded.iter() {
                needed += 1;
                room += frag.byte_count() as usize;
                if room >= data.len() {
                    break;
                }
            }
            if needed == 0 || room < data.len() {
                // stall until more fragments are preloaded
                return Ok(false);
            }
            st.preloaded.drain(..needed).collect()
        } else {
            let mut frags = SmallVec::new();
            for i in 0..packet.res_count {
                let seg = self
                    .memory
                    .read_val::<ResultSegment>(self.res_addr(packet.res_slot + i))
                    .map_err(memory_error)?;
                frags.push(seg);
            }
            frags
        };

        if fragments.is_empty() {
            return Err(BackendError::Ring("packet without result segments"));
        }

        let mut written = 0usize;
        let last = fragments.len() - 1;
        for (i, frag) in fragments.iter().enumerate() {
            let n = (frag.byte_count() as usize).min(data.len() - written);
            if n > 0 {
                self.memory
                    .write(frag.dst_addr, &data[written..written + n])
                    .map_err(memory_error)?;
            }
            written += n;

            let mut flags = SegmentFlags::empty();
            if i == 0 {
                flags |= SegmentFlags::FIRST;
            }
            let mut token = None;
            if i == last {
                flags |= SegmentFlags::LAST;
                if written < data.len() {
                    flags |= SegmentFlags::BUF_OVERFLOW;
                }
                if let Some(first) = commands.first()
                    && first.token_addr != 0
                {
                    token = Some(OutputToken {
                        packet_length: written as u32,
                        error_code: st.next_error.unwrap_or(0),
                        bypass_words: first.bypass_words as u32,
                        ..Default::default()
                    });
                }
                st.next_error = None;
            }
            st.done.push_back(ProcessedSegment {
                control: control_word(n as u32, flags),
                token,
            });
        }

        st.pending.pop_front();
        Ok(true)
    }
}

impl<M: DmaMemory + Send + Sync> RingBackend for SimBackend<M> {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            text: String::from("Simulated EIP-202 packet engine, rings: __"),
            supported: SupportedFuncs::OUTBOUND_CRYPTO
                | SupportedFuncs::INBOUND_CRYPTO
                | SupportedFuncs::AES
                | SupportedFuncs::SHA1
                | SupportedFuncs::SHA2_256
                | SupportedFuncs::GHASH,
        }
    }

    fn features(&self) -> RingFeatures {
        RingFeatures {
            command_capacity: self.config.command_capacity,
            result_capacity: self.config.result_capacity,
            max_logical_descriptors: self.config.max_logical_descriptors,
            max_packets: self.config.max_packets,
            separate_rings: self.config.separate_rings,
            scatter_gather: self.config.scatter_gather,
            interrupts: self.config.interrupts,
            status_map: StatusMap::EIP96,
        }
    }

    fn init(&self, config: &RingConfig) -> Result<(), BackendError> {
        if config.continuous_scatter() && !self.config.scatter_gather {
            return Err(BackendError::InvalidConfig(
                "continuous scatter requires scatter/gather",
            ));
        }
        let mut st = self.state.lock();
        *st = SimState {
            initialized: true,
            ring_config: *config,
            free_override: st.free_override,
            ..Default::default()
        };
        Ok(())
    }

    fn uninit(&self) -> Result<(), BackendError> {
        let mut st = self.state.lock();
        st.initialized = false;
        st.pending.clear();
        st.preloaded.clear();
        st.done.clear();
        st.processed.clear();
        st.enabled = [None, None];
        Ok(())
    }

    fn free_space(&self, ring: RingId) -> Result<usize, BackendError> {
        let st = self.state.lock();
        if !st.initialized {
            return Err(BackendError::Ring("rings not initialized"));
        }
        Ok(self.free_in(&st, ring))
    }

    fn submit(&self, requests: &[PreparedRequest]) -> Result<usize, BackendError> {
        let mut st = self.state.lock();
        if !st.initialized {
            return Err(BackendError::Ring("rings not initialized"));
        }
        if st.fail_next_submit {
            st.fail_next_submit = false;
            return Err(BackendError::Ring("injected submit failure"));
        }

        let limit = st.accept_limit.take().unwrap_or(usize::MAX);
        let continuous = st.ring_config.continuous_scatter();
        let override_cap = st.free_override.take();

        let mut accepted = 0;
        for request in requests.iter().take(limit) {
            let cmd_free = self.free_in(&st, RingId::Command);
            let res_free = self.free_in(&st, RingId::Result);
            if request.commands.len() > cmd_free
                || (!continuous && request.results.len() > res_free)
            {
                break;
            }

            let packet = PendingPacket {
                cmd_slot: st.cmd_write,
                cmd_count: request.commands.len(),
                res_slot: st.res_write,
                res_count: request.results.len(),
            };
            for (i, seg) in request.commands.iter().enumerate() {
                self.memory
                    .write_val(self.cmd_addr(packet.cmd_slot + i), *seg)
                    .map_err(memory_error)?;
            }
            for (i, seg) in request.results.iter().enumerate() {
                self.memory
                    .write_val(self.res_addr(packet.res_slot + i), *seg)
                    .map_err(memory_error)?;
            }

            st.cmd_write = (st.cmd_write + packet.cmd_count) % self.config.command_capacity;
            st.res_write = (st.res_write + packet.res_count) % self.config.result_capacity;
            st.pending.push_back(packet);
            st.submitted.push(request.clone());
            accepted += 1;
        }

        st.free_override = override_cap;
        Ok(accepted)
    }

    fn peek_processed(&self, limit: usize) -> Result<Vec<ProcessedSegment>, BackendError> {
        let st = self.state.lock();
        Ok(st.processed.iter().take(limit).copied().collect())
    }

    fn acknowledge(&self, count: usize) -> Result<(), BackendError> {
        let mut st = self.state.lock();
        if count > st.processed.len() {
            return Err(BackendError::Ring("acknowledged more than processed"));
        }
        st.processed.drain(..count);
        Ok(())
    }

    fn processed_packets(&self) -> Result<usize, BackendError> {
        Ok(Self::count_packets(&self.state.lock().processed))
    }

    fn enable_interrupt(
        &self,
        source: InterruptSource,
        threshold: usize,
    ) -> Result<(), BackendError> {
        if !self.config.interrupts {
            return Err(BackendError::Unsupported);
        }
        self.state.lock().enabled[source_index(source)] = Some(threshold);
        Ok(())
    }

    fn disable_interrupt(&self, source: InterruptSource) -> Result<(), BackendError> {
        self.state.lock().enabled[source_index(source)] = None;
        Ok(())
    }

    fn set_handler(&self, source: InterruptSource, handler: Option<InterruptHandler>) {
        self.handlers.lock()[source_index(source)] = handler;
    }

    fn prepare_context(&self, context: &ContextAddresses) -> Result<(), BackendError> {
        self.state.lock().contexts.push(*context);
        Ok(())
    }

    fn remove_context(&self, context: &ContextAddresses) -> Result<(), BackendError> {
        let mut st = self.state.lock();
        let before = st.contexts.len();
        st.contexts.retain(|c| c.record != context.record);
        if st.contexts.len() == before {
            return Err(BackendError::Ring("unknown security context"));
        }
        Ok(())
    }

    fn preload_scatter(&self, segments: &[ResultSegment]) -> Result<usize, BackendError> {
        let mut st = self.state.lock();
        if !st.ring_config.continuous_scatter() {
            return Err(BackendError::InvalidConfig("not in continuous scatter mode"));
        }

        let room = self.free_in(&st, RingId::Result);
        let n = segments.len().min(room);
        for seg in &segments[..n] {
            let addr = self.res_addr(st.res_write);
            self.memory.write_val(addr, *seg).map_err(memory_error)?;
            st.res_write = (st.res_write + 1) % self.config.result_capacity;
            st.preloaded.push_back(*seg);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::Zeroable;

    use super::*;

    fn make() -> (Arc<SimMemory>, SimBackend<SimMemory>) {
        let memory = Arc::new(SimMemory::new(0, 1024 * 1024));
        let backend = SimBackend::new(memory.clone(), SimConfig::default());
        backend.init(&RingConfig::default()).unwrap();
        (memory, backend)
    }

    fn request(src: u64, dst: u64, len: u32, token: u64) -> PreparedRequest {
        let mut cmd = CommandSegment::zeroed();
        cmd.src_addr = src;
        cmd.token_addr = token;
        cmd.control = control_word(len, SegmentFlags::FIRST | SegmentFlags::LAST);
        let res = ResultSegment {
            dst_addr: dst,
            control: control_word(len, SegmentFlags::FIRST | SegmentFlags::LAST),
            reserved: 0,
        };
        PreparedRequest {
            commands: smallvec::smallvec![cmd],
            results: smallvec::smallvec![res],
        }
    }

    #[test]
    fn test_memory_bounds() {
        let memory = SimMemory::new(0x1000, 16);
        assert!(memory.write(0x1000, &[1; 16]).is_ok());
        assert_eq!(
            memory.write(0x1008, &[1; 16]),
            Err(SimMemoryError {
                addr: 0x1008,
                len: 16
            })
        );
        let mut buf = [0u8; 4];
        assert!(memory.read(0xfff, &mut buf).is_err());
    }

    #[test]
    fn test_memory_copy() {
        let memory = SimMemory::new(0, 4096);
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        memory.write(0, &data).unwrap();
        memory.copy(0, 2000, 1000).unwrap();
        let mut out = vec![0u8; 1000];
        memory.read(2000, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_process_transforms_data() {
        let (memory, backend) = make();
        memory.write(0x8_0000, &[0x0f; 8]).unwrap();

        assert_eq!(backend.submit(&[request(0x8_0000, 0x9_0000, 8, 0x7_0000)]).unwrap(), 1);
        assert_eq!(backend.free_space(RingId::Command).unwrap(), 31);
        assert_eq!(backend.process(1).unwrap(), 1);

        let mut out = [0u8; 8];
        memory.read(0x9_0000, &mut out).unwrap();
        assert_eq!(out, [0xf0; 8]);

        let segs = backend.peek_processed(8).unwrap();
        assert_eq!(segs.len(), 1);
        assert!(segs[0].is_first() && segs[0].is_last());
        assert_eq!(segs[0].token.unwrap().packet_length, 8);
        assert_eq!(backend.processed_packets().unwrap(), 1);

        backend.acknowledge(1).unwrap();
        assert_eq!(backend.processed_packets().unwrap(), 0);
        assert_eq!(backend.free_space(RingId::Result).unwrap(), 32);
    }

    #[test]
    fn test_submit_stops_when_full() {
        let memory = Arc::new(SimMemory::new(0, 1024 * 1024));
        let config = SimConfig {
            command_capacity: 2,
            result_capacity: 2,
            ..Default::default()
        };
        let backend = SimBackend::new(memory, config);
        backend.init(&RingConfig::default()).unwrap();

        let batch = [
            request(0x8_0000, 0x9_0000, 4, 0),
            request(0x8_0000, 0x9_0000, 4, 0),
            request(0x8_0000, 0x9_0000, 4, 0),
        ];
        assert_eq!(backend.submit(&batch).unwrap(), 2);
        assert_eq!(backend.free_space(RingId::Command).unwrap(), 0);
    }

    #[test]
    fn test_accept_limit_is_one_shot() {
        let (_memory, backend) = make();
        let batch = [
            request(0x8_0000, 0x9_0000, 4, 0),
            request(0x8_0000, 0x9_0000, 4, 0),
        ];
        backend.set_accept_limit(1);
        assert_eq!(backend.submit(&batch).unwrap(), 1);
        assert_eq!(backend.submit(&batch).unwrap(), 2);
    }

    #[test]
    fn test_segments_revealed_one_at_a_time() {
        let (_memory, backend) = make();
        let mut req = request(0x8_0000, 0x9_0000, 8, 0);
        req.results[0].control = control_word(4, SegmentFlags::FIRST);
        req.results.push(ResultSegment {
            dst_addr: 0x9_0004,
            control: control_word(4, SegmentFlags::LAST),
            reserved: 0,
        });
        backend.submit(&[req]).unwrap();

        assert_eq!(backend.process_segments(1).unwrap(), 1);
        let segs = backend.peek_processed(8).unwrap();
        assert_eq!(segs.len(), 1);
        assert!(segs[0].is_first() && !segs[0].is_last());
        assert_eq!(backend.processed_packets().unwrap(), 0);

        assert_eq!(backend.process_segments(1).unwrap(), 1);
        assert_eq!(backend.processed_packets().unwrap(), 1);
    }

    #[test]
    fn test_interrupt_raised_on_threshold() {
        let (_memory, backend) = make();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        backend.set_handler(
            InterruptSource::Result,
            Some(Arc::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        );
        backend.enable_interrupt(InterruptSource::Result, 2).unwrap();

        backend
            .submit(&[
                request(0x8_0000, 0x9_0000, 4, 0),
                request(0x8_0000, 0x9_0000, 4, 0),
            ])
            .unwrap();
        backend.process(1).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        backend.process(1).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
