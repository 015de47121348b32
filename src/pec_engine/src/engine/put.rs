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

//! Submission path.
//!
//! A batch is cut into rounds. A round is either a run of requests that each
//! take one command slot (and one result slot), sized to the current ring
//! room, or a single request spanning several segments. Every request of a
//! round is bounced, encoded and staged in the correlation FIFO before the
//! round is handed to the backend in one call. Whatever the backend does not
//! take is withdrawn from the FIFO, newest first, and its bounce buffers are
//! dropped without copy-back. Only then are the surviving entries published
//! to the completion side.

use alloc::vec::Vec;

use bytemuck::Zeroable;
use smallvec::SmallVec;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use super::{Interface, Submission};
use crate::backend::{BackendError, RingBackend, RingId};
use crate::config::RingConfig;
use crate::descriptor::{
    BYTE_COUNT_MASK, CommandDescriptor, CommandSegment, MAX_WORD_COUNT, PreparedRequest,
    ResultSegment, SegmentFlags, control_word,
};
use crate::dmabuf::BufferHandle;
use crate::error::PecError;
use crate::fifo::CorrelationEntry;
use crate::memory::DmaMemory;

/// Ring slots one request occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Shape {
    /// Particles of the source list, 0 for a plain buffer.
    pub(super) gather: usize,
    /// Particles of the destination list, 0 for a plain buffer.
    pub(super) scatter: usize,
    pub(super) commands: usize,
    pub(super) results: usize,
}

impl Shape {
    fn single_slot(&self) -> bool {
        self.commands == 1 && self.results <= 1
    }
}

/// FIRST on the first of `count` segments, LAST on the final one.
fn frame(index: usize, count: usize) -> SegmentFlags {
    let mut flags = SegmentFlags::empty();
    if index == 0 {
        flags |= SegmentFlags::FIRST;
    }
    if index + 1 == count {
        flags |= SegmentFlags::LAST;
    }
    flags
}

impl<B, M> Interface<B, M>
where
    B: RingBackend + 'static,
    M: DmaMemory + Send + Sync + 'static,
{
    /// Submit a batch of requests.
    ///
    /// Returns how many requests from the front of `requests` were accepted,
    /// together with the error that stopped the batch, if any. A full ring is
    /// not an error: the count is simply short and the caller resubmits the
    /// rest later. At most `max_logical_descriptors` requests are looked at.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level = "Trace"))]
    pub fn put(&self, requests: &[CommandDescriptor]) -> (usize, Result<(), PecError>) {
        let outcome = {
            let Some(mut guard) = self.put.try_lock() else {
                return (0, Err(PecError::Busy));
            };
            let Some(submission) = guard.as_mut() else {
                return (0, Err(PecError::NotInitialized));
            };
            self.put_batch(submission, requests)
        };

        if let Err(err) = self.fire_results() {
            log::warn!("interface {}: result notification check: {}", self.index, err);
        }
        outcome
    }

    fn put_batch(
        &self,
        submission: &mut Submission,
        requests: &[CommandDescriptor],
    ) -> (usize, Result<(), PecError>) {
        let limit = requests.len().min(self.features.max_logical_descriptors);
        if limit < requests.len() {
            log::debug!(
                "interface {}: batch of {} capped to {}",
                self.index,
                requests.len(),
                limit
            );
        }
        let batch = &requests[..limit];
        let ring = submission.ring;

        let mut done = 0;
        while done < batch.len() {
            let round = match self.round_size(submission, &batch[done..]) {
                Ok(n) => n,
                Err(err) => return (done, Err(err)),
            };
            if round == 0 {
                break;
            }

            let (accepted, result) = self.put_round(submission, &ring, &batch[done..done + round]);
            done += accepted;
            // a short round means the device is full
            if result.is_err() || accepted < round {
                return (done, result);
            }
        }

        (done, Ok(()))
    }

    /// How many requests from the front of `pending` go into the next round.
    fn round_size(
        &self,
        submission: &Submission,
        pending: &[CommandDescriptor],
    ) -> Result<usize, PecError> {
        let ring = &submission.ring;
        let continuous = ring.continuous_scatter();
        let first = self.shape(&pending[0], ring)?;

        let commands = self.backend.free_space(RingId::Command)?;
        let results = if continuous {
            usize::MAX
        } else {
            self.backend.free_space(RingId::Result)?
        };
        let entries = if continuous {
            usize::MAX
        } else {
            submission.producer.free()
        };

        if !first.single_slot() {
            let fits =
                first.commands <= commands && first.results <= results && entries > 0;
            return Ok(usize::from(fits));
        }

        // An invalid request ends the run; the next round reports it.
        let run = pending
            .iter()
            .take_while(|r| self.shape(r, ring).is_ok_and(|s| s.single_slot()))
            .count();
        Ok(run.min(commands).min(results).min(entries))
    }

    /// Validate `request` and work out its ring footprint.
    pub(super) fn shape(
        &self,
        request: &CommandDescriptor,
        ring: &RingConfig,
    ) -> Result<Shape, PecError> {
        if request.token_word_count > MAX_WORD_COUNT {
            return Err(PecError::InvalidArgument("token word count above 255"));
        }
        if request.bypass_word_count > MAX_WORD_COUNT {
            return Err(PecError::InvalidArgument("bypass word count above 255"));
        }
        if request.src_byte_count > BYTE_COUNT_MASK {
            return Err(PecError::InvalidArgument("byte count too large for a segment"));
        }

        let continuous = ring.continuous_scatter();
        // only a request with neither buffer is a record invalidation
        match (request.src, request.dst) {
            (None, Some(_)) => {
                return Err(PecError::InvalidArgument("destination without a source"));
            }
            (Some(_), None) if !continuous => {
                return Err(PecError::InvalidArgument("source without a destination"));
            }
            _ => {}
        }

        let gather = request.src.map_or(0, |h| self.arena.sg_capacity(h));
        let scatter = match request.dst {
            Some(h) if !continuous => self.arena.sg_capacity(h),
            _ => 0,
        };

        if (gather > 0 || scatter > 0) && !self.features.scatter_gather {
            return Err(PecError::InvalidArgument("scatter/gather not supported"));
        }
        let max = self.features.max_logical_descriptors;
        if gather > max || scatter > max {
            return Err(PecError::InvalidArgument("more particles than logical descriptors"));
        }

        let mut commands = gather.max(1);
        let mut results = if continuous { 0 } else { scatter.max(1) };
        if !self.features.separate_rings && !continuous {
            let n = commands.max(results);
            commands = n;
            results = n;
        }

        Ok(Shape {
            gather,
            scatter,
            commands,
            results,
        })
    }

    fn put_round(
        &self,
        submission: &mut Submission,
        ring: &RingConfig,
        requests: &[CommandDescriptor],
    ) -> (usize, Result<(), PecError>) {
        let continuous = ring.continuous_scatter();
        let mut prepared: Vec<PreparedRequest> = Vec::with_capacity(requests.len());
        let mut failure = None;

        for request in requests {
            let (segments, entry) = match self.prepare(request, ring) {
                Ok(p) => p,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            if !continuous && !submission.producer.push(entry) {
                log::error!("interface {}: correlation FIFO full", self.index);
                self.discard_entry(&entry);
                failure = Some(PecError::Internal("correlation FIFO full"));
                break;
            }
            prepared.push(segments);
        }

        if prepared.is_empty() {
            return (0, failure.map_or(Ok(()), Err));
        }

        let accepted = match self.backend.submit(&prepared) {
            Ok(n) if n > prepared.len() => {
                log::error!(
                    "interface {}: backend accepted {} of {} requests",
                    self.index,
                    n,
                    prepared.len()
                );
                if failure.is_none() {
                    failure = Some(PecError::Internal("backend accepted more than submitted"));
                }
                prepared.len()
            }
            Ok(n) => n,
            Err(err) => {
                log::error!("interface {}: submit failed: {}", self.index, err);
                self.withdraw(submission, prepared.len());
                return (0, Err(PecError::Internal("backend rejected the submission")));
            }
        };

        if accepted < prepared.len() {
            log::warn!(
                "interface {}: rolling back {} of {} requests",
                self.index,
                prepared.len() - accepted,
                prepared.len()
            );
            self.withdraw(submission, prepared.len() - accepted);
        }
        submission.producer.publish();

        (accepted, failure.map_or(Ok(()), Err))
    }

    /// Withdraw the `count` newest staged entries, dropping their bounces.
    fn withdraw(&self, submission: &mut Submission, count: usize) {
        for _ in 0..count {
            match submission.producer.withdraw_last() {
                Some(entry) => self.discard_entry(&entry),
                None => break,
            }
        }
    }

    /// Bounce and encode one request.
    fn prepare(
        &self,
        request: &CommandDescriptor,
        ring: &RingConfig,
    ) -> Result<(PreparedRequest, CorrelationEntry), PecError> {
        let shape = self.shape(request, ring)?;
        let continuous = ring.continuous_scatter();
        let dst = if continuous { None } else { request.dst };

        let entry = CorrelationEntry {
            user_tag: request.user_tag,
            src: request.src,
            dst,
            token: request.token,
            bypass_word_count: request.bypass_word_count,
        };

        // particles of lists are never bounced
        let data_src = request.src.filter(|_| shape.gather == 0);
        let data_dst = dst.filter(|_| shape.scatter == 0);
        let data_bounced = self.bounce_data(data_src, data_dst, continuous)?;

        let token_bounced = match request.token {
            Some(token) => match self.bounce_single(token, continuous) {
                Ok(bounced) => bounced,
                Err(err) => {
                    if data_bounced {
                        self.discard_entry(&CorrelationEntry { token: None, ..entry });
                    }
                    return Err(err);
                }
            },
            None => false,
        };

        match self.encode(request, &shape, dst) {
            Ok(segments) => Ok((segments, entry)),
            Err(err) => {
                let cleanup = CorrelationEntry {
                    src: entry.src.filter(|_| data_bounced),
                    dst: entry.dst.filter(|_| data_bounced),
                    token: entry.token.filter(|_| token_bounced),
                    ..entry
                };
                self.discard_entry(&cleanup);
                Err(err)
            }
        }
    }

    /// Bounce the plain source and destination of a request. Returns whether
    /// a bounce buffer was attached.
    fn bounce_data(
        &self,
        src: Option<BufferHandle>,
        dst: Option<BufferHandle>,
        continuous: bool,
    ) -> Result<bool, PecError> {
        if !self.bounce_buffers || continuous {
            for handle in src.into_iter().chain(dst) {
                self.require_accessible(handle)?;
            }
            return Ok(false);
        }

        match (src, dst) {
            (Some(src), Some(dst)) => Ok(self.arena.ensure_accessible_pair(src, dst)?.is_some()),
            (Some(handle), None) | (None, Some(handle)) => {
                Ok(self.arena.ensure_accessible(handle)? != handle)
            }
            (None, None) => Ok(false),
        }
    }

    /// Bounce a single buffer. Returns whether a bounce buffer was attached.
    fn bounce_single(&self, handle: BufferHandle, continuous: bool) -> Result<bool, PecError> {
        if !self.bounce_buffers || continuous {
            self.require_accessible(handle)?;
            return Ok(false);
        }
        Ok(self.arena.ensure_accessible(handle)? != handle)
    }

    fn require_accessible(&self, handle: BufferHandle) -> Result<(), PecError> {
        let info = self.arena.info(handle)?;
        if info.accessible || info.size == 0 {
            Ok(())
        } else {
            Err(PecError::InvalidArgument("buffer is not DMA accessible"))
        }
    }

    /// Build the ring segments of a request whose buffers are all reachable.
    fn encode(
        &self,
        request: &CommandDescriptor,
        shape: &Shape,
        dst: Option<BufferHandle>,
    ) -> Result<PreparedRequest, PecError> {
        let mut gather: SmallVec<[(u64, u32); 4]> = SmallVec::new();
        match request.src {
            Some(list) if shape.gather > 0 => {
                let mut remaining = request.src_byte_count;
                for index in 0..shape.gather {
                    let particle = self
                        .arena
                        .sg_read(list, index)?
                        .ok_or(PecError::InvalidArgument("gather list has an unset particle"))?;
                    self.require_accessible(particle.handle)?;
                    self.arena.sync_for_device(particle.handle)?;

                    let len = particle.byte_count.min(remaining);
                    remaining -= len;
                    gather.push((self.arena.bus_address(particle.handle)?, len));
                }
                if remaining > 0 {
                    return Err(PecError::InvalidArgument("gather list shorter than byte count"));
                }
            }
            Some(src) => {
                if request.src_byte_count as usize > self.arena.info(src)?.size {
                    return Err(PecError::InvalidArgument("byte count exceeds source buffer"));
                }
                self.arena.sync_for_device(src)?;
                gather.push((self.arena.bus_address(src)?, request.src_byte_count));
            }
            None => gather.push((0, 0)),
        }
        // zero length dummies pad the gather side to the equalized count
        gather.resize(shape.commands, (0, 0));

        let token_addr = match request.token {
            Some(token) => {
                self.arena.sync_for_device(token)?;
                self.arena.bus_address(token)?
            }
            None => 0,
        };
        let context_addr = match request.context {
            Some(context) => self.arena.bus_address(context)?,
            None => 0,
        };
        let engine = request.engine.map_or(0, |id| {
            CommandSegment::FORCE_ENGINE | (id & CommandSegment::ENGINE_ID_MASK)
        });

        let count = gather.len();
        let commands = gather
            .iter()
            .enumerate()
            .map(|(i, &(addr, len))| {
                let mut segment = CommandSegment {
                    src_addr: addr,
                    control: control_word(len, frame(i, count)),
                    ..CommandSegment::zeroed()
                };
                if i == 0 {
                    segment.token_addr = token_addr;
                    segment.context_addr = context_addr;
                    segment.token_words = request.token_word_count as u16;
                    segment.engine = engine;
                    segment.bypass_words = request.bypass_word_count as u8;
                }
                segment
            })
            .collect();

        let mut scatter: SmallVec<[(u64, u32); 4]> = SmallVec::new();
        if shape.results > 0 {
            match dst {
                Some(list) if shape.scatter > 0 => {
                    for index in 0..shape.scatter {
                        let particle = self
                            .arena
                            .sg_read(list, index)?
                            .ok_or(PecError::InvalidArgument("scatter list has an unset particle"))?;
                        self.require_accessible(particle.handle)?;
                        self.arena.sync_for_device(particle.handle)?;
                        scatter.push((
                            self.arena.bus_address(particle.handle)?,
                            particle.byte_count.min(BYTE_COUNT_MASK),
                        ));
                    }
                }
                Some(dst) => {
                    let size = self.arena.info(dst)?.size.min(BYTE_COUNT_MASK as usize) as u32;
                    self.arena.sync_for_device(dst)?;
                    scatter.push((self.arena.bus_address(dst)?, size));
                }
                None => scatter.push((0, 0)),
            }
            scatter.resize(shape.results, (0, 0));
        }

        let count = scatter.len();
        let results = scatter
            .iter()
            .enumerate()
            .map(|(i, &(addr, len))| ResultSegment {
                dst_addr: addr,
                control: control_word(len, frame(i, count)),
                reserved: 0,
            })
            .collect();

        Ok(PreparedRequest { commands, results })
    }

    /// Hand empty destination buffers to the device for continuous scatter
    /// mode. Returns how many were queued; the rest did not fit.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn scatter_preload(&self, buffers: &[BufferHandle]) -> Result<usize, PecError> {
        let mut guard = self.put.try_lock().ok_or(PecError::Busy)?;
        let submission = guard.as_mut().ok_or(PecError::NotInitialized)?;
        if !submission.ring.continuous_scatter() {
            return Err(PecError::InvalidArgument("not in continuous scatter mode"));
        }

        let room = self.backend.free_space(RingId::Result)?;
        let n = buffers
            .len()
            .min(submission.producer.free())
            .min(self.features.max_logical_descriptors)
            .min(room);
        let fragment = submission.ring.fixed_scatter_fragment_size();

        let mut segments: SmallVec<[ResultSegment; 8]> = SmallVec::new();
        for &buffer in &buffers[..n] {
            let bounced = match self.bounce_single(buffer, false) {
                Ok(bounced) => bounced,
                Err(err) => {
                    self.withdraw(submission, segments.len());
                    return Err(err);
                }
            };
            let entry = CorrelationEntry {
                dst: Some(buffer),
                ..Default::default()
            };

            let segment = match self.preload_segment(buffer, fragment) {
                Ok(segment) => segment,
                Err(err) => {
                    if bounced {
                        self.discard_entry(&entry);
                    }
                    self.withdraw(submission, segments.len());
                    return Err(err);
                }
            };
            if !submission.producer.push(entry) {
                log::error!("interface {}: correlation FIFO full", self.index);
                self.discard_entry(&entry);
                self.withdraw(submission, segments.len());
                return Err(PecError::Internal("correlation FIFO full"));
            }
            segments.push(segment);
        }

        let accepted = match self.backend.preload_scatter(&segments) {
            Ok(accepted) => accepted.min(segments.len()),
            Err(err) => {
                self.withdraw(submission, segments.len());
                return Err(match err {
                    BackendError::Unsupported => PecError::NotImplemented,
                    err => err.into(),
                });
            }
        };
        self.withdraw(submission, segments.len() - accepted);
        submission.producer.publish();

        Ok(accepted)
    }

    fn preload_segment(&self, buffer: BufferHandle, fragment: u32) -> Result<ResultSegment, PecError> {
        let mut size = self.arena.info(buffer)?.size.min(BYTE_COUNT_MASK as usize) as u32;
        if fragment != 0 {
            size = size.min(fragment);
        }
        self.arena.sync_for_device(buffer)?;
        Ok(ResultSegment {
            dst_addr: self.arena.bus_address(buffer)?,
            control: control_word(size, SegmentFlags::empty()),
            reserved: 0,
        })
    }
}
