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

//! Engine error taxonomy.
//!
//! Every failure of an upward API call is a [`PecError`]. Errors raised by
//! lower layers (buffer arena, ring backend) keep their own type and convert
//! through `#[from]`; [`PecError::kind`] folds all of them into the five
//! caller-visible classes of [`PecErrorKind`].
//!
//! Per-request hardware failures are not errors at this level. They arrive as
//! [`PacketErrors`](crate::status::PacketErrors) bits in a successful result.

use thiserror::Error;

use crate::backend::BackendError;
use crate::dmabuf::DmaError;

/// Caller-visible error class.
///
/// The numeric values are stable so the class can cross an FFI boundary as a
/// plain status code (`0` is reserved for success).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PecErrorKind {
    /// Lock contention. Retry later.
    Busy = 1,
    /// Bad handle, bad parameter, oversized batch or uninitialized interface.
    InvalidArgument = 2,
    /// Bounce buffer or FIFO capacity exceeded.
    ResourceExhausted = 3,
    /// Backend inconsistency. Rollback has already run.
    Internal = 4,
    /// Optional capability missing.
    NotImplemented = 5,
}

#[derive(Debug, Error)]
pub enum PecError {
    #[error("Interface is busy, try again")]
    Busy,
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Interface {0} does not exist")]
    NoSuchInterface(usize),
    #[error("Interface is not initialized")]
    NotInitialized,
    #[error("Resources exhausted: {0}")]
    ResourceExhausted(&'static str),
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("Operation not implemented")]
    NotImplemented,
    #[error("DMA buffer error: {0}")]
    Dma(#[from] DmaError),
    #[error("Ring backend error: {0}")]
    Backend(#[from] BackendError),
}

impl PecError {
    /// Classify this error.
    pub fn kind(&self) -> PecErrorKind {
        match self {
            PecError::Busy => PecErrorKind::Busy,
            PecError::InvalidArgument(_)
            | PecError::NoSuchInterface(_)
            | PecError::NotInitialized => PecErrorKind::InvalidArgument,
            PecError::ResourceExhausted(_) => PecErrorKind::ResourceExhausted,
            PecError::Internal(_) => PecErrorKind::Internal,
            PecError::NotImplemented => PecErrorKind::NotImplemented,
            PecError::Dma(err) => err.kind(),
            PecError::Backend(err) => err.kind(),
        }
    }

    /// Whether the caller is expected to simply retry.
    pub fn is_retryable(&self) -> bool {
        self.kind() == PecErrorKind::Busy
    }
}
