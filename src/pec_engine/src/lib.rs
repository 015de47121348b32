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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
// We use Arbitrary during fuzzing, which requires std
#![cfg_attr(not(any(test, feature = "fuzzing", feature = "std")), no_std)]

//! Packet engine control: the submission/completion ring core.
//!
//! A caller hands batches of transform requests to [`PacketEngine::put`] and
//! collects finished work with [`PacketEngine::get`]. In between, the engine
//!
//! - makes every buffer addressable by the accelerator, copying foreign memory
//!   through bounce buffers carved from a DMA pool ([`dmabuf`], [`bounce`]),
//! - fragments scatter/gather requests into ring segments and encodes them
//!   for the [`RingBackend`] that owns the actual hardware rings,
//! - remembers what each descriptor belonged to in a side-channel
//!   correlation FIFO ([`fifo`]) so results can be matched back in order,
//! - rolls back whatever the ring did not accept,
//! - and fires one-shot "space available" / "results available" callbacks
//!   ([`notify`]).
//!
//! Every entry point is non-blocking: contended locks surface as
//! [`PecError::Busy`] instead of waiting.

extern crate alloc;

pub mod backend;
pub mod bounce;
pub mod config;
pub mod descriptor;
pub mod dmabuf;
pub mod engine;
pub mod error;
pub mod fifo;
pub mod memory;
pub mod notify;
pub mod pool;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod status;

pub use backend::{
    BackendError, Capabilities, InterruptHandler, InterruptSource, RingBackend, RingFeatures,
    RingId, SupportedFuncs,
};
pub use config::{EngineConfig, RingConfig};
pub use descriptor::{CommandDescriptor, ResultDescriptor, SecurityContext};
pub use dmabuf::{Accessibility, BufferHandle, DmaArena};
pub use engine::{Interface, PacketEngine};
pub use error::{PecError, PecErrorKind};
pub use memory::DmaMemory;
pub use notify::NotifyCallback;
pub use status::{PacketErrors, ResultStatus, StatusMap};
