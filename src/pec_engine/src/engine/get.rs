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

//! Completion path.
//!
//! Processed result segments are grouped into packets by their FIRST/LAST
//! markers. A packet whose last segment has not been processed yet ends the
//! walk: nothing of it is acknowledged, so the next call starts from the same
//! ring position. Each complete packet takes one correlation entry, or one
//! per segment in continuous scatter mode, where every segment landed in its
//! own preloaded buffer.

use alloc::vec::Vec;
use core::ops::Range;

use smallvec::SmallVec;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use super::{Completion, Interface};
use crate::backend::RingBackend;
use crate::descriptor::{ProcessedSegment, ResultDescriptor, SegmentFlags};
use crate::dmabuf::BufferHandle;
use crate::error::PecError;
use crate::fifo::CorrelationEntry;
use crate::memory::DmaMemory;

/// Find the complete packets among `segments`, at most `limit` of them.
fn group_packets(
    segments: &[ProcessedSegment],
    limit: usize,
) -> Result<SmallVec<[Range<usize>; 8]>, PecError> {
    let mut packets = SmallVec::new();
    let mut start = 0;

    while packets.len() < limit && start < segments.len() {
        if !segments[start].is_first() {
            return Err(PecError::Internal("result segment out of sequence"));
        }
        let Some(offset) = segments[start..].iter().position(ProcessedSegment::is_last) else {
            // the rest of this packet is still being processed
            break;
        };
        let end = start + offset + 1;
        if segments[start + 1..end].iter().any(ProcessedSegment::is_first) {
            return Err(PecError::Internal("result segment out of sequence"));
        }
        packets.push(start..end);
        start = end;
    }

    Ok(packets)
}

impl<B, M> Interface<B, M>
where
    B: RingBackend + 'static,
    M: DmaMemory + Send + Sync + 'static,
{
    /// Collect up to `limit` completed requests, oldest first.
    ///
    /// Per-request failures are reported in [`ResultDescriptor::status`];
    /// an `Err` means nothing was consumed.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn get(&self, limit: usize) -> Result<Vec<ResultDescriptor>, PecError> {
        let results = {
            let mut guard = self.get.try_lock().ok_or(PecError::Busy)?;
            let completion = guard.as_mut().ok_or(PecError::NotInitialized)?;
            self.get_packets(completion, limit)?
        };

        if let Err(err) = self.fire_space() {
            log::warn!("interface {}: space notification check: {}", self.index, err);
        }
        Ok(results)
    }

    fn get_packets(
        &self,
        completion: &mut Completion,
        limit: usize,
    ) -> Result<Vec<ResultDescriptor>, PecError> {
        let max = self.features.max_logical_descriptors.max(1);
        let limit = limit.min(max);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let continuous = completion.ring.continuous_scatter();

        let window = limit.saturating_mul(max);
        let segments = self.backend.peek_processed(window)?;
        let packets = group_packets(&segments, limit).inspect_err(|_| {
            log::error!("interface {}: malformed result ring contents", self.index);
        })?;
        let Some(consumed) = packets.last().map(|p| p.end) else {
            return Ok(Vec::new());
        };

        let needed = if continuous {
            consumed
        } else {
            packets.len()
        };
        if completion.consumer.len() < needed {
            log::error!(
                "interface {}: {} results but only {} correlation entries",
                self.index,
                needed,
                completion.consumer.len()
            );
            return Err(PecError::Internal("correlation FIFO out of step with result ring"));
        }
        self.backend.acknowledge(consumed)?;

        let mut results = Vec::with_capacity(packets.len());
        for packet in packets {
            results.push(self.complete(completion, &segments[packet], continuous)?);
        }
        Ok(results)
    }

    fn complete(
        &self,
        completion: &mut Completion,
        segments: &[ProcessedSegment],
        continuous: bool,
    ) -> Result<ResultDescriptor, PecError> {
        let last = segments
            .last()
            .ok_or(PecError::Internal("empty result packet"))?;
        let overflow = segments.iter().fold(SegmentFlags::empty(), |acc, s| {
            acc | (s.flags() & (SegmentFlags::BUF_OVERFLOW | SegmentFlags::DESC_OVERFLOW))
        });
        let control = last.control | overflow.bits();
        let token = last.token;
        let written: u32 = segments.iter().map(ProcessedSegment::byte_count).sum();

        let mut result = ResultDescriptor {
            particle_count: segments.len(),
            status: self.features.status_map.translate(control, token.as_ref()),
            status1: control,
            output_token: token,
            dst_byte_count: token.map_or(written, |t| t.packet_length),
            ..Default::default()
        };

        if continuous {
            for index in 0..segments.len() {
                let entry = self.pop(completion)?;
                if index == 0 {
                    result.user_tag = entry.user_tag;
                }
                if let Some(dst) = entry.dst {
                    self.finish(&entry);
                    result.particles.push(dst);
                }
            }
            result.dst = result.particles.first().copied();
            result.bypass_word_count = token.map_or(0, |t| t.bypass_words);
        } else {
            let entry = self.pop(completion)?;
            self.finish(&entry);
            result.user_tag = entry.user_tag;
            result.src = entry.src;
            result.dst = entry.dst;
            result.bypass_word_count = token.map_or(entry.bypass_word_count, |t| t.bypass_words);
        }

        if !result.status.is_ok() {
            log::debug!(
                "interface {}: request {:#x} failed: {:?}",
                self.index,
                result.user_tag,
                result.status.errors
            );
        }
        Ok(result)
    }

    fn pop(&self, completion: &mut Completion) -> Result<CorrelationEntry, PecError> {
        completion
            .consumer
            .pop()
            .ok_or(PecError::Internal("correlation FIFO drained early"))
    }

    /// Hand the buffers of a completed request back to the host.
    fn finish(&self, entry: &CorrelationEntry) {
        if let Some(dst) = entry.dst {
            self.sync_for_host(dst);
        }

        let restored = match (entry.src, entry.dst) {
            (src, Some(dst)) => self.arena.restore_pair(src, dst),
            (Some(src), None) => self.arena.discard(src),
            (None, None) => Ok(()),
        };
        let restored = restored.and(match entry.token {
            Some(token) => self.arena.restore(token),
            None => Ok(()),
        });
        if let Err(err) = restored {
            log::error!("interface {}: restoring bounced buffers: {}", self.index, err);
        }
    }

    fn sync_for_host(&self, handle: BufferHandle) {
        let synced = match self.arena.sg_capacity(handle) {
            0 => self.arena.sync_for_host(handle),
            particles => (0..particles).try_for_each(|index| match self.arena.sg_read(handle, index)? {
                Some(particle) => self.arena.sync_for_host(particle.handle),
                None => Ok(()),
            }),
        };
        if let Err(err) = synced {
            log::warn!("interface {}: sync for host: {}", self.index, err);
        }
    }
}
