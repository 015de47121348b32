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

//! Request, result and ring segment types.
//!
//! Callers describe work with [`CommandDescriptor`]s and receive
//! [`ResultDescriptor`]s. Between the two, the engine lowers every request to
//! one or more fixed-layout ring segments ([`CommandSegment`],
//! [`ResultSegment`]) that a ring backend can copy straight into descriptor
//! memory, and reads back [`ProcessedSegment`]s with the device's control word
//! and, on the last segment, the [`OutputToken`].
//!
//! Segment control word layout:
//!
//! ```text
//!  31      24 23    22   21       20       19                0
//! +----------+-----+----+--------+--------+-------------------+
//! | reserved |FIRST|LAST|BUF_OVFL|DSC_OVFL|     byte count    |
//! +----------+-----+----+--------+--------+-------------------+
//! ```

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

use crate::dmabuf::BufferHandle;
use crate::status::ResultStatus;

/// Mask of the byte count field in a segment control word.
pub const BYTE_COUNT_MASK: u32 = (1 << 20) - 1;

/// Largest bypass or token word count a descriptor can carry.
pub const MAX_WORD_COUNT: u32 = 255;

bitflags! {
    /// Segment control flags.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct SegmentFlags: u32 {
        /// The device ran out of result descriptors for this packet.
        const DESC_OVERFLOW = 1 << 20;
        /// The packet did not fit in the destination buffers.
        const BUF_OVERFLOW  = 1 << 21;
        /// Last segment of a logical request.
        const LAST          = 1 << 22;
        /// First segment of a logical request.
        const FIRST         = 1 << 23;
    }
}

/// Build a control word from a byte count and flags.
#[inline]
pub fn control_word(byte_count: u32, flags: SegmentFlags) -> u32 {
    (byte_count & BYTE_COUNT_MASK) | flags.bits()
}

/// One command ring slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct CommandSegment {
    /// Bus address of the input fragment.
    pub src_addr: u64,
    /// Bus address of the instruction token (first segment only).
    pub token_addr: u64,
    /// Bus address of the security context record (first segment only).
    pub context_addr: u64,
    /// Byte count and [`SegmentFlags`].
    pub control: u32,
    /// Token length in 32-bit words (first segment only).
    pub token_words: u16,
    /// Engine id in bits 0..5, [`CommandSegment::FORCE_ENGINE`] in bit 5.
    pub engine: u8,
    /// Words passed through unprocessed (first segment only).
    pub bypass_words: u8,
}

const _: () = assert!(core::mem::size_of::<CommandSegment>() == 32);
const _: () = assert!(CommandSegment::CONTROL_OFFSET == 24);
const _: () = assert!(CommandSegment::ENGINE_OFFSET == 30);
const _: () = assert!(CommandSegment::BYPASS_OFFSET == 31);

impl CommandSegment {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const CONTROL_OFFSET: usize = core::mem::offset_of!(Self, control);
    pub const ENGINE_OFFSET: usize = core::mem::offset_of!(Self, engine);
    pub const BYPASS_OFFSET: usize = core::mem::offset_of!(Self, bypass_words);

    pub const ENGINE_ID_MASK: u8 = 0x1f;
    pub const FORCE_ENGINE: u8 = 1 << 5;

    #[inline]
    pub fn flags(&self) -> SegmentFlags {
        SegmentFlags::from_bits_truncate(self.control)
    }

    #[inline]
    pub fn byte_count(&self) -> u32 {
        self.control & BYTE_COUNT_MASK
    }

    /// Engine the segment is pinned to, if any.
    #[inline]
    pub fn forced_engine(&self) -> Option<u8> {
        (self.engine & Self::FORCE_ENGINE != 0).then_some(self.engine & Self::ENGINE_ID_MASK)
    }
}

/// One result ring slot, prepared by the engine before submission.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct ResultSegment {
    /// Bus address of the output fragment.
    pub dst_addr: u64,
    /// Fragment size and [`SegmentFlags`].
    pub control: u32,
    pub reserved: u32,
}

const _: () = assert!(core::mem::size_of::<ResultSegment>() == 16);
const _: () = assert!(ResultSegment::CONTROL_OFFSET == 8);

impl ResultSegment {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const CONTROL_OFFSET: usize = core::mem::offset_of!(Self, control);

    #[inline]
    pub fn flags(&self) -> SegmentFlags {
        SegmentFlags::from_bits_truncate(self.control)
    }

    #[inline]
    pub fn byte_count(&self) -> u32 {
        self.control & BYTE_COUNT_MASK
    }
}

/// Result token the device appends to the last segment of a packet.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct OutputToken {
    /// Bytes written to the destination.
    pub packet_length: u32,
    /// Device specific error bits, translated by a
    /// [`StatusMap`](crate::status::StatusMap).
    pub error_code: u32,
    /// Words passed through unprocessed in front of the packet.
    pub bypass_words: u32,
    pub pad_byte_count: u8,
    pub next_header: u8,
    pub reserved: u16,
}

const _: () = assert!(core::mem::size_of::<OutputToken>() == 16);

impl OutputToken {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// A completed result ring slot as reported by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessedSegment {
    /// Byte count written into this fragment and [`SegmentFlags`].
    pub control: u32,
    /// Output token, present on the last segment of a packet.
    pub token: Option<OutputToken>,
}

impl ProcessedSegment {
    #[inline]
    pub fn flags(&self) -> SegmentFlags {
        SegmentFlags::from_bits_truncate(self.control)
    }

    #[inline]
    pub fn byte_count(&self) -> u32 {
        self.control & BYTE_COUNT_MASK
    }

    #[inline]
    pub fn is_first(&self) -> bool {
        self.flags().contains(SegmentFlags::FIRST)
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        self.flags().contains(SegmentFlags::LAST)
    }
}

/// All ring slots of one logical request. The backend accepts or rejects a
/// request as a whole.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PreparedRequest {
    pub commands: SmallVec<[CommandSegment; 4]>,
    pub results: SmallVec<[ResultSegment; 4]>,
}

/// A transform request.
///
/// `src` and `dst` may be plain buffers or scatter/gather lists. Leaving both
/// empty submits a record invalidation that touches no packet data. `dst` may
/// equal `src` for in-place operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandDescriptor {
    /// Opaque value returned unchanged in the matching result.
    pub user_tag: u64,
    pub src: Option<BufferHandle>,
    pub dst: Option<BufferHandle>,
    /// Bytes to process from `src`.
    pub src_byte_count: u32,
    /// Instruction token and its length in words.
    pub token: Option<BufferHandle>,
    pub token_word_count: u32,
    /// Words at the front of the packet that bypass processing.
    pub bypass_word_count: u32,
    /// Security context record the transform uses.
    pub context: Option<BufferHandle>,
    /// Pin the request to one processing engine.
    pub engine: Option<u8>,
}

impl CommandDescriptor {
    pub fn new(
        user_tag: u64,
        src: BufferHandle,
        dst: BufferHandle,
        src_byte_count: u32,
    ) -> Self {
        Self {
            user_tag,
            src: Some(src),
            dst: Some(dst),
            src_byte_count,
            ..Default::default()
        }
    }

    /// Request that only invalidates the context record.
    pub fn invalidate(user_tag: u64, context: BufferHandle) -> Self {
        Self {
            user_tag,
            context: Some(context),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: BufferHandle, word_count: u32) -> Self {
        self.token = Some(token);
        self.token_word_count = word_count;
        self
    }

    pub fn with_context(mut self, context: BufferHandle) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_bypass(mut self, word_count: u32) -> Self {
        self.bypass_word_count = word_count;
        self
    }

    pub fn on_engine(mut self, engine: u8) -> Self {
        self.engine = Some(engine & CommandSegment::ENGINE_ID_MASK);
        self
    }
}

/// A completed transform.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultDescriptor {
    pub user_tag: u64,
    pub src: Option<BufferHandle>,
    pub dst: Option<BufferHandle>,
    /// Preloaded buffers the result was scattered over (continuous scatter
    /// mode only).
    pub particles: SmallVec<[BufferHandle; 4]>,
    /// Result ring segments the packet occupied.
    pub particle_count: usize,
    pub dst_byte_count: u32,
    pub bypass_word_count: u32,
    pub status: ResultStatus,
    /// Raw control word of the last segment.
    pub status1: u32,
    pub output_token: Option<OutputToken>,
}

/// Handles making up one security context.
///
/// `arc4_state` is skipped for bounce buffering when it lies inside `record`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecurityContext {
    pub record: BufferHandle,
    pub state: Option<BufferHandle>,
    pub arc4_state: Option<BufferHandle>,
}

impl SecurityContext {
    pub fn new(record: BufferHandle) -> Self {
        Self {
            record,
            state: None,
            arc4_state: None,
        }
    }
}

/// Bus addresses of a registered security context, as handed to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextAddresses {
    pub record: u64,
    pub state: Option<u64>,
    pub arc4_state: Option<u64>,
}

/// Parameters for [`cd_control_write`](crate::PacketEngine::cd_control_write).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketParams {
    pub engine: Option<u8>,
    pub flags: u32,
}
