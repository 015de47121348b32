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

//! Ring backend abstraction.
//!
//! The engine never touches device registers. Everything that depends on a
//! concrete accelerator generation sits behind [`RingBackend`]: ring
//! occupancy, writing prepared segments into the command and result rings,
//! reading processed result segments back, interrupt control and optional
//! hooks for security contexts and streaming mode.
//!
//! What the backend can do is described once by [`RingFeatures`] and read at
//! interface init, so one engine binary drives backends with and without
//! scatter/gather, with shared or separate rings, with or without interrupts.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use thiserror::Error;

use crate::config::RingConfig;
use crate::descriptor::{
    CommandDescriptor, ContextAddresses, PacketParams, PreparedRequest, ProcessedSegment,
    ResultSegment,
};
use crate::error::PecErrorKind;
use crate::status::StatusMap;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    #[error("Operation not supported by the backend")]
    Unsupported,
    #[error("Ring failure: {0}")]
    Ring(&'static str),
    #[error("Invalid ring configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("Descriptor memory access failed")]
    Memory,
}

impl BackendError {
    pub fn kind(&self) -> PecErrorKind {
        match self {
            BackendError::Unsupported => PecErrorKind::NotImplemented,
            BackendError::InvalidConfig(_) => PecErrorKind::InvalidArgument,
            BackendError::Ring(_) | BackendError::Memory => PecErrorKind::Internal,
        }
    }
}

/// One of the two rings of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingId {
    Command,
    Result,
}

/// Interrupt sources an interface can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptSource {
    /// Command ring fill level dropped to the programmed threshold.
    Command,
    /// Result ring holds at least the programmed number of processed packets.
    Result,
}

/// Handler the backend calls from its interrupt context.
pub type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

bitflags! {
    /// Functions the device supports.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SupportedFuncs: u32 {
        const OUTBOUND_CRYPTO = 1 << 1;
        const INBOUND_CRYPTO  = 1 << 2;
        const FRAGMENTATION   = 1 << 3;
        const MASK_1024       = 1 << 4;
        const BC0             = 1 << 5;
        const SM4             = 1 << 6;
        const SM3             = 1 << 7;
        const CHACHA20        = 1 << 8;
        const POLY1305        = 1 << 9;
        const MASK_256        = 1 << 10;
        const MASK_384        = 1 << 11;
        const AES             = 1 << 12;
        const AES_FEEDBACK    = 1 << 13;
        const DES             = 1 << 15;
        const DES_FEEDBACK    = 1 << 16;
        const ARC4            = (1 << 18) | (1 << 19);
        const AES_XTS         = 1 << 20;
        const WIRELESS        = 1 << 21;
        const MD5             = 1 << 22;
        const SHA1            = 1 << 23;
        const SHA2_256        = 1 << 25;
        const SHA2_512        = 1 << 26;
        const CBC_MAC         = 1 << 27;
        const CBC_MAC_256     = 1 << 29;
        const GHASH           = 1 << 30;
        const SHA3            = 1 << 31;
    }
}

/// Human readable description plus supported functions.
///
/// `_` characters in `text` are placeholders the engine fills with the
/// interface count.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub text: String,
    pub supported: SupportedFuncs,
}

/// Static properties of a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingFeatures {
    /// Command ring capacity in segments.
    pub command_capacity: usize,
    /// Result ring capacity in segments.
    pub result_capacity: usize,
    /// Most segments a single Put or Get may touch.
    pub max_logical_descriptors: usize,
    /// Upper bound for notification thresholds.
    pub max_packets: usize,
    /// Command and result rings live in separate memory. When false the two
    /// rings overlap and a request must use the same number of slots in both.
    pub separate_rings: bool,
    /// Scatter/gather lists are accepted as source and destination.
    pub scatter_gather: bool,
    /// The backend raises [`InterruptSource`] events.
    pub interrupts: bool,
    /// Translation of the device's error code bits.
    pub status_map: StatusMap,
}

/// Driver of one command/result ring pair.
///
/// All methods take `&self`: the engine calls submission side methods under
/// its put lock and completion side methods under its get lock, possibly
/// from two threads at once. Implementations synchronize their own state.
pub trait RingBackend: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn features(&self) -> RingFeatures;

    /// Bring up the rings.
    fn init(&self, config: &RingConfig) -> Result<(), BackendError>;

    /// Tear down the rings. Unprocessed slots are dropped.
    fn uninit(&self) -> Result<(), BackendError>;

    /// Free slots in `ring`, read fresh from the device.
    fn free_space(&self, ring: RingId) -> Result<usize, BackendError>;

    /// Write prepared requests into the rings.
    ///
    /// Requests are taken in order, each either completely or not at all.
    /// Returns how many were written.
    fn submit(&self, requests: &[PreparedRequest]) -> Result<usize, BackendError>;

    /// Look at up to `limit` processed result segments, oldest first, without
    /// consuming them.
    fn peek_processed(&self, limit: usize) -> Result<Vec<ProcessedSegment>, BackendError>;

    /// Consume the `count` oldest processed result segments.
    fn acknowledge(&self, count: usize) -> Result<(), BackendError>;

    /// Number of processed packets waiting in the result ring.
    fn processed_packets(&self) -> Result<usize, BackendError>;

    /// Raise `source` once its level reaches `threshold`.
    fn enable_interrupt(&self, source: InterruptSource, threshold: usize)
    -> Result<(), BackendError>;

    fn disable_interrupt(&self, source: InterruptSource) -> Result<(), BackendError>;

    /// Install or remove the handler for `source`.
    fn set_handler(&self, source: InterruptSource, handler: Option<InterruptHandler>);

    /// Make a registered security context known to the device.
    fn prepare_context(&self, _context: &ContextAddresses) -> Result<(), BackendError> {
        Ok(())
    }

    /// Forget a security context before its memory is handed back.
    fn remove_context(&self, _context: &ContextAddresses) -> Result<(), BackendError> {
        Ok(())
    }

    /// Queue empty destination fragments for continuous scatter mode.
    /// Returns how many were queued.
    fn preload_scatter(&self, _segments: &[ResultSegment]) -> Result<usize, BackendError> {
        Err(BackendError::Unsupported)
    }

    /// Fill device specific control fields of `command` from `params`.
    fn write_control(
        &self,
        _command: &mut CommandDescriptor,
        _params: &PacketParams,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported)
    }
}
