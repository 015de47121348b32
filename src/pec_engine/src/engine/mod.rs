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

//! The packet engine: per-interface lifecycle, submission, completion,
//! notification and security context bookkeeping.
//!
//! A [`PacketEngine`] owns the DMA buffer arena and one [`Interface`] per ring
//! backend. Each interface has three non-blocking critical sections:
//!
//! - `lifecycle` serializes [`init`](Interface::init) and
//!   [`uninit`](Interface::uninit),
//! - `put` guards the submission side: command ring writes and the producer
//!   half of the correlation FIFO,
//! - `get` guards the completion side: result ring reads and the consumer
//!   half.
//!
//! Put and Get may run concurrently on different threads. Uninit takes all
//! three locks. A lock that is already held is reported as
//! [`PecError::Busy`]; nothing in here waits.

mod get;
mod put;

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::backend::{
    BackendError, Capabilities, InterruptHandler, InterruptSource, RingBackend, RingFeatures,
    RingId,
};
use crate::config::{EngineConfig, RingConfig};
use crate::descriptor::{
    CommandDescriptor, ContextAddresses, PacketParams, ResultDescriptor, SecurityContext,
};
use crate::dmabuf::{BufferHandle, DmaArena, DmaError};
use crate::error::PecError;
use crate::fifo::{CorrelationEntry, FifoConsumer, FifoProducer, correlation_fifo};
use crate::memory::DmaMemory;
use crate::notify::{Notification, NotifyCallback, Requested};
use crate::pool::BufferPool;
use crate::status::ResultStatus;

/// Longest capabilities text a backend may report.
pub const MAX_CAPABILITIES_TEXT: usize = 128;

/// Submission side state, present while the interface is initialized.
struct Submission {
    producer: FifoProducer,
    ring: RingConfig,
}

/// Completion side state, present while the interface is initialized.
struct Completion {
    consumer: FifoConsumer,
    ring: RingConfig,
}

/// One command/result ring pair and everything the engine keeps for it.
pub struct Interface<B, M: DmaMemory> {
    index: usize,
    backend: B,
    features: RingFeatures,
    arena: Arc<DmaArena<M>>,
    bounce_buffers: bool,
    lifecycle: Mutex<()>,
    put: Mutex<Option<Submission>>,
    get: Mutex<Option<Completion>>,
    space: Notification,
    results: Notification,
    initialized: AtomicBool,
}

impl<B, M: DmaMemory> core::fmt::Debug for Interface<B, M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Interface")
            .field("index", &self.index)
            .field("features", &self.features)
            .field("initialized", &self.initialized.load(Ordering::Acquire))
            .field("space", &self.space)
            .field("results", &self.results)
            .finish_non_exhaustive()
    }
}

impl<B, M> Interface<B, M>
where
    B: RingBackend + 'static,
    M: DmaMemory + Send + Sync + 'static,
{
    fn new(index: usize, backend: B, arena: Arc<DmaArena<M>>, bounce_buffers: bool) -> Self {
        let features = backend.features();
        Self {
            index,
            backend,
            features,
            arena,
            bounce_buffers,
            lifecycle: Mutex::new(()),
            put: Mutex::new(None),
            get: Mutex::new(None),
            space: Notification::new(),
            results: Notification::new(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn features(&self) -> &RingFeatures {
        &self.features
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> Result<(), PecError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(PecError::NotInitialized)
        }
    }

    /// Bring the interface up. Calling it on an initialized interface does
    /// nothing.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn init(self: &Arc<Self>, ring: RingConfig) -> Result<(), PecError> {
        let _lifecycle = self.lifecycle.try_lock().ok_or(PecError::Busy)?;
        if self.is_initialized() {
            return Ok(());
        }

        if ring.continuous_scatter() && !self.features.scatter_gather {
            return Err(PecError::InvalidArgument(
                "continuous scatter needs scatter/gather support",
            ));
        }

        let mut put = self.put.try_lock().ok_or(PecError::Busy)?;
        let mut get = self.get.try_lock().ok_or(PecError::Busy)?;

        // Room for every command slot plus every preloaded result fragment.
        let slots = self.features.command_capacity + self.features.result_capacity + 1;
        let (producer, consumer) = correlation_fifo(slots)
            .ok_or(PecError::Internal("correlation FIFO has no capacity"))?;

        self.backend.init(&ring)?;

        if self.features.interrupts {
            for source in [InterruptSource::Command, InterruptSource::Result] {
                self.backend
                    .set_handler(source, Some(interrupt_handler(Arc::downgrade(self), source)));
            }
        }

        *put = Some(Submission { producer, ring });
        *get = Some(Completion { consumer, ring });
        self.initialized.store(true, Ordering::Release);

        log::debug!(
            "interface {} up: {} command / {} result slots, continuous scatter {}",
            self.index,
            self.features.command_capacity,
            self.features.result_capacity,
            ring.continuous_scatter()
        );
        Ok(())
    }

    /// Take the interface down. Requests still queued are dropped and their
    /// bounce buffers released without copy-back.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn uninit(&self) -> Result<(), PecError> {
        let _lifecycle = self.lifecycle.try_lock().ok_or(PecError::Busy)?;
        let mut put = self.put.try_lock().ok_or(PecError::Busy)?;
        let mut get = self.get.try_lock().ok_or(PecError::Busy)?;

        if !self.is_initialized() {
            return Ok(());
        }
        self.initialized.store(false, Ordering::Release);

        if self.features.interrupts {
            for source in [InterruptSource::Command, InterruptSource::Result] {
                if let Err(err) = self.backend.disable_interrupt(source) {
                    log::warn!("interface {}: disabling {:?} interrupt: {}", self.index, source, err);
                }
                self.backend.set_handler(source, None);
            }
        }
        self.space.clear();
        self.results.clear();

        *put = None;
        if let Some(mut completion) = get.take() {
            let mut dropped = 0;
            while let Some(entry) = completion.consumer.pop() {
                self.discard_entry(&entry);
                dropped += 1;
            }
            if dropped > 0 {
                log::warn!("interface {}: dropped {} queued requests", self.index, dropped);
            }
        }

        self.backend.uninit()?;
        log::debug!("interface {} down", self.index);
        Ok(())
    }

    /// Release the bounce buffers of an entry that will never complete.
    fn discard_entry(&self, entry: &CorrelationEntry) {
        let released = match (entry.src, entry.dst) {
            (src, Some(dst)) => self.arena.discard_pair(src, dst),
            (Some(src), None) => self.arena.discard(src),
            (None, None) => Ok(()),
        };
        let released = released.and(match entry.token {
            Some(token) => self.arena.discard(token),
            None => Ok(()),
        });
        if let Err(err) = released {
            log::warn!("interface {}: releasing bounce buffers: {}", self.index, err);
        }
    }

    /// Make `handle` reachable by the device, bouncing it when allowed.
    fn accessible(&self, handle: BufferHandle) -> Result<BufferHandle, PecError> {
        if self.bounce_buffers {
            return Ok(self.arena.ensure_accessible(handle)?);
        }
        let info = self.arena.info(handle)?;
        if info.accessible || info.size == 0 {
            Ok(handle)
        } else {
            Err(PecError::InvalidArgument("buffer is not DMA accessible"))
        }
    }

    fn check_threshold(&self, count: usize) -> Result<(), PecError> {
        if count == 0 || count > self.features.max_packets {
            return Err(PecError::InvalidArgument("notification threshold out of range"));
        }
        Ok(())
    }

    /// Run `callback` once the command ring has at least `count` free slots.
    ///
    /// Fires immediately if that already holds. A pending registration is
    /// replaced.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn request_space_notify(
        &self,
        callback: NotifyCallback,
        count: usize,
    ) -> Result<(), PecError> {
        self.ensure_initialized()?;
        self.check_threshold(count)?;

        let level = self.backend.free_space(RingId::Command)?;
        match self.space.request(callback, count, level) {
            Requested::Ready(callback) => {
                // a replaced registration may have left the interrupt on
                self.quiet(InterruptSource::Command);
                callback();
            }
            Requested::Armed => {
                if self.features.interrupts {
                    self.backend.enable_interrupt(InterruptSource::Command, count)?;
                }
                // the ring may have drained before the interrupt was enabled
                self.fire_space()?;
            }
        }
        Ok(())
    }

    /// Run `callback` once at least `count` processed packets are waiting.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn request_result_notify(
        &self,
        callback: NotifyCallback,
        count: usize,
    ) -> Result<(), PecError> {
        self.ensure_initialized()?;
        self.check_threshold(count)?;

        let level = self.backend.processed_packets()?;
        match self.results.request(callback, count, level) {
            Requested::Ready(callback) => {
                // a replaced registration may have left the interrupt on
                self.quiet(InterruptSource::Result);
                callback();
            }
            Requested::Armed => {
                if self.features.interrupts {
                    self.backend.enable_interrupt(InterruptSource::Result, count)?;
                }
                self.fire_results()?;
            }
        }
        Ok(())
    }

    /// Fire whichever armed notification has reached its threshold.
    pub fn check_notifications(&self) -> Result<(), PecError> {
        self.ensure_initialized()?;
        self.fire_space()?;
        self.fire_results()
    }

    fn fire_space(&self) -> Result<(), PecError> {
        if !self.space.is_armed() {
            return Ok(());
        }
        let level = self.backend.free_space(RingId::Command)?;
        if let Some(callback) = self.space.take_if_ready(level) {
            self.quiet(InterruptSource::Command);
            callback();
        }
        Ok(())
    }

    fn fire_results(&self) -> Result<(), PecError> {
        if !self.results.is_armed() {
            return Ok(());
        }
        let level = self.backend.processed_packets()?;
        if let Some(callback) = self.results.take_if_ready(level) {
            self.quiet(InterruptSource::Result);
            callback();
        }
        Ok(())
    }

    fn quiet(&self, source: InterruptSource) {
        if !self.features.interrupts {
            return;
        }
        if let Err(err) = self.backend.disable_interrupt(source) {
            log::warn!("interface {}: disabling {:?} interrupt: {}", self.index, source, err);
        }
    }

    fn on_interrupt(&self, source: InterruptSource) {
        if !self.is_initialized() {
            return;
        }
        let fired = match source {
            InterruptSource::Command => self.fire_space(),
            InterruptSource::Result => self.fire_results(),
        };
        if let Err(err) = fired {
            log::error!("interface {}: {:?} interrupt: {}", self.index, source, err);
        }
    }

    /// Make a security context reachable by the device and announce it to
    /// the backend.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn register_security_context(&self, context: &SecurityContext) -> Result<(), PecError> {
        self.ensure_initialized()?;

        let handles = self.context_handles(context)?;
        let mut bounced: Vec<BufferHandle> = Vec::with_capacity(handles.len());
        for &handle in &handles {
            match self.accessible(handle) {
                Ok(_) => bounced.push(handle),
                Err(err) => {
                    self.discard_all(&bounced);
                    return Err(err);
                }
            }
        }

        let addresses = self.context_addresses(context)?;
        if let Err(err) = self.backend.prepare_context(&addresses) {
            self.discard_all(&bounced);
            return Err(err.into());
        }
        Ok(())
    }

    /// Withdraw a security context from the backend and write back any
    /// bounced copies.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn unregister_security_context(&self, context: &SecurityContext) -> Result<(), PecError> {
        self.ensure_initialized()?;

        let addresses = self.context_addresses(context)?;
        self.backend.remove_context(&addresses)?;

        for handle in self.context_handles(context)? {
            self.arena.restore(handle)?;
        }
        Ok(())
    }

    /// Handles of a context that need their own bounce buffer.
    fn context_handles(&self, context: &SecurityContext) -> Result<Vec<BufferHandle>, PecError> {
        let mut handles = Vec::with_capacity(3);
        handles.push(context.record);
        if let Some(state) = context.state {
            handles.push(state);
        }
        if let Some(arc4) = context.arc4_state
            && !self.arena.is_sub_range_of(arc4, context.record)?
        {
            handles.push(arc4);
        }
        Ok(handles)
    }

    fn context_addresses(&self, context: &SecurityContext) -> Result<ContextAddresses, DmaError> {
        Ok(ContextAddresses {
            record: self.arena.bus_address(context.record)?,
            state: context
                .state
                .map(|h| self.arena.bus_address(h))
                .transpose()?,
            arc4_state: context
                .arc4_state
                .map(|h| self.arena.bus_address(h))
                .transpose()?,
        })
    }

    fn discard_all(&self, handles: &[BufferHandle]) {
        for &handle in handles {
            if let Err(err) = self.arena.discard(handle) {
                log::warn!("interface {}: releasing bounce buffer: {}", self.index, err);
            }
        }
    }

    /// Not supported: preload consumption is reported through result
    /// notifications.
    pub fn scatter_preload_notify_request(
        &self,
        _callback: NotifyCallback,
        _count: usize,
    ) -> Result<(), PecError> {
        Err(PecError::NotImplemented)
    }

    /// Let the backend fill device specific control fields of `command`.
    pub fn cd_control_write(
        &self,
        command: &mut CommandDescriptor,
        params: &PacketParams,
    ) -> Result<(), PecError> {
        match self.backend.write_control(command, params) {
            Err(BackendError::Unsupported) => Err(PecError::NotImplemented),
            other => Ok(other?),
        }
    }

    /// Decode the status of `result` from its raw status words.
    pub fn rd_status_read(&self, result: &ResultDescriptor) -> ResultStatus {
        self.features
            .status_map
            .translate(result.status1, result.output_token.as_ref())
    }
}

fn interrupt_handler<B, M>(interface: Weak<Interface<B, M>>, source: InterruptSource) -> InterruptHandler
where
    B: RingBackend + 'static,
    M: DmaMemory + Send + Sync + 'static,
{
    Arc::new(move || {
        if let Some(interface) = interface.upgrade() {
            interface.on_interrupt(source);
        }
    })
}

/// The engine: a DMA buffer arena and a set of ring interfaces.
pub struct PacketEngine<B, M: DmaMemory> {
    config: EngineConfig,
    arena: Arc<DmaArena<M>>,
    interfaces: Vec<Arc<Interface<B, M>>>,
}

impl<B, M: DmaMemory> core::fmt::Debug for PacketEngine<B, M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketEngine")
            .field("config", &self.config)
            .field("interfaces", &self.interfaces)
            .finish_non_exhaustive()
    }
}

impl<B, M> PacketEngine<B, M>
where
    B: RingBackend + 'static,
    M: DmaMemory + Send + Sync + 'static,
{
    /// Create an engine with one interface per backend. The DMA pool covers
    /// `config.dma_pool_base()` onwards in `memory`.
    pub fn new(
        config: EngineConfig,
        memory: Arc<M>,
        backends: impl IntoIterator<Item = B>,
    ) -> Result<Self, PecError> {
        let pool = BufferPool::new(config.dma_pool_base(), config.dma_pool_size())
            .map_err(DmaError::from)?;
        let arena = Arc::new(DmaArena::new(memory, pool));

        let interfaces = backends
            .into_iter()
            .enumerate()
            .map(|(index, backend)| {
                Arc::new(Interface::new(
                    index,
                    backend,
                    arena.clone(),
                    config.bounce_buffers(),
                ))
            })
            .collect();

        Ok(Self {
            config,
            arena,
            interfaces,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The buffer arena shared by all interfaces.
    pub fn arena(&self) -> &Arc<DmaArena<M>> {
        &self.arena
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    pub fn interface(&self, iface: usize) -> Result<&Arc<Interface<B, M>>, PecError> {
        self.interfaces
            .get(iface)
            .ok_or(PecError::NoSuchInterface(iface))
    }

    /// Describe the device behind the first interface. Each `_` in the
    /// backend text is replaced by the next digit of the interface count.
    pub fn capabilities(&self) -> Result<Capabilities, PecError> {
        let caps = self.interface(0)?.backend.capabilities();
        if caps.text.len() > MAX_CAPABILITIES_TEXT {
            return Err(PecError::Internal("capabilities text too long"));
        }

        let count = self.interfaces.len();
        let digits = [count / 10, count % 10];
        let mut next = digits.iter();
        let mut text = String::with_capacity(caps.text.len());
        for c in caps.text.chars() {
            if c != '_' {
                text.push(c);
                continue;
            }
            match next.next() {
                Some(&d) if d > 9 => text.push('?'),
                Some(&d) => text.push(char::from(b'0' + d as u8)),
                None => return Err(PecError::Internal("too many placeholders in capabilities text")),
            }
        }

        Ok(Capabilities {
            text,
            supported: caps.supported,
        })
    }

    pub fn init(&self, iface: usize, ring: RingConfig) -> Result<(), PecError> {
        self.interface(iface)?.init(ring)
    }

    pub fn uninit(&self, iface: usize) -> Result<(), PecError> {
        self.interface(iface)?.uninit()
    }

    /// Submit `requests` on `iface`. See [`Interface::put`].
    pub fn put(
        &self,
        iface: usize,
        requests: &[CommandDescriptor],
    ) -> (usize, Result<(), PecError>) {
        match self.interface(iface) {
            Ok(interface) => interface.put(requests),
            Err(err) => (0, Err(err)),
        }
    }

    /// Collect up to `limit` results from `iface`. See [`Interface::get`].
    pub fn get(&self, iface: usize, limit: usize) -> Result<Vec<ResultDescriptor>, PecError> {
        self.interface(iface)?.get(limit)
    }

    pub fn request_space_notify(
        &self,
        iface: usize,
        callback: NotifyCallback,
        count: usize,
    ) -> Result<(), PecError> {
        self.interface(iface)?.request_space_notify(callback, count)
    }

    pub fn request_result_notify(
        &self,
        iface: usize,
        callback: NotifyCallback,
        count: usize,
    ) -> Result<(), PecError> {
        self.interface(iface)?.request_result_notify(callback, count)
    }

    pub fn check_notifications(&self, iface: usize) -> Result<(), PecError> {
        self.interface(iface)?.check_notifications()
    }

    pub fn register_security_context(
        &self,
        iface: usize,
        context: &SecurityContext,
    ) -> Result<(), PecError> {
        self.interface(iface)?.register_security_context(context)
    }

    pub fn unregister_security_context(
        &self,
        iface: usize,
        context: &SecurityContext,
    ) -> Result<(), PecError> {
        self.interface(iface)?.unregister_security_context(context)
    }

    pub fn scatter_preload(&self, iface: usize, buffers: &[BufferHandle]) -> Result<usize, PecError> {
        self.interface(iface)?.scatter_preload(buffers)
    }

    pub fn scatter_preload_notify_request(
        &self,
        iface: usize,
        callback: NotifyCallback,
        count: usize,
    ) -> Result<(), PecError> {
        self.interface(iface)?
            .scatter_preload_notify_request(callback, count)
    }

    pub fn cd_control_write(
        &self,
        iface: usize,
        command: &mut CommandDescriptor,
        params: &PacketParams,
    ) -> Result<(), PecError> {
        self.interface(iface)?.cd_control_write(command, params)
    }

    pub fn rd_status_read(
        &self,
        iface: usize,
        result: &ResultDescriptor,
    ) -> Result<ResultStatus, PecError> {
        Ok(self.interface(iface)?.rd_status_read(result))
    }
}
