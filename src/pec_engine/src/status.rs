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

//! Result status translation.
//!
//! Devices report per-packet failures in their own bit layout. The completion
//! path translates them into the device independent [`PacketErrors`] set with
//! a [`StatusMap`] supplied by the ring backend. A failed packet is still a
//! successful result: the bits travel in [`ResultStatus`].

use bitflags::bitflags;

use crate::descriptor::{OutputToken, SegmentFlags};

bitflags! {
    /// Per-packet error bits.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PacketErrors: u32 {
        /// Authentication (ICV) check failed.
        const AUTH                = 1 << 0;
        /// Padding check failed.
        const PAD                 = 1 << 1;
        /// Sequence number check failed or replay detected.
        const SEQUENCE            = 1 << 2;
        const BAD_COMMAND         = 1 << 3;
        const BAD_ALGORITHM       = 1 << 4;
        /// Operation prohibited by the context.
        const PROHIBITED          = 1 << 5;
        const ZERO_LENGTH         = 1 << 6;
        const BAD_IP              = 1 << 7;
        const SPI                 = 1 << 8;
        /// Input length not a multiple of the cipher block size.
        const CRYPT_BLOCK_SIZE    = 1 << 9;
        const BAD_COMBINATION     = 1 << 10;
        const LENGTH              = 1 << 11;
        const PROCESSING          = 1 << 12;
        const INBOUND_LENGTH      = 1 << 13;
        const SYSTEM_BUS          = 1 << 14;
        const DESCRIPTOR          = 1 << 15;
        /// Input length not a multiple of the hash block size.
        const HASH_BLOCK_SIZE     = 1 << 16;
        const TOKEN               = 1 << 17;
        const BYPASS              = 1 << 18;
        const HASH_OVERFLOW       = 1 << 19;
        /// TTL or hop limit exceeded.
        const TTL_HOP             = 1 << 20;
        const CHECKSUM            = 1 << 21;
        const TIMEOUT             = 1 << 22;
        /// Ran out of result descriptors.
        const DESCRIPTOR_OVERFLOW = 1 << 25;
        /// Ran out of destination buffer space.
        const BUFFER_OVERFLOW     = 1 << 26;
    }
}

/// Translated status of one result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResultStatus {
    pub errors: PacketErrors,
    pub pad_byte_count: u8,
    pub next_header: u8,
}

impl ResultStatus {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Mapping from device error bit positions to [`PacketErrors`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusMap {
    error_bits: &'static [(u8, PacketErrors)],
}

impl StatusMap {
    /// EIP-96 output token error code layout.
    pub const EIP96: StatusMap = StatusMap::new(&[
        (0, PacketErrors::LENGTH),
        (1, PacketErrors::TOKEN),
        (2, PacketErrors::BYPASS),
        (3, PacketErrors::CRYPT_BLOCK_SIZE),
        (4, PacketErrors::HASH_BLOCK_SIZE),
        (5, PacketErrors::BAD_COMBINATION),
        (6, PacketErrors::PROHIBITED),
        (7, PacketErrors::HASH_OVERFLOW),
        (8, PacketErrors::TTL_HOP),
        (9, PacketErrors::AUTH),
        (10, PacketErrors::SEQUENCE),
        (11, PacketErrors::SPI),
        // bit 12 reports both checksum and pad failures
        (12, PacketErrors::CHECKSUM),
        (12, PacketErrors::PAD),
        (14, PacketErrors::TIMEOUT),
    ]);

    /// Device bits are already [`PacketErrors`] bits.
    pub const IDENTITY: StatusMap = StatusMap::new(&[]);

    pub const fn new(error_bits: &'static [(u8, PacketErrors)]) -> Self {
        Self { error_bits }
    }

    /// Translate a device error code.
    pub fn errors(&self, error_code: u32) -> PacketErrors {
        if self.error_bits.is_empty() {
            return PacketErrors::from_bits_truncate(error_code);
        }

        self.error_bits
            .iter()
            .filter(|(bit, _)| error_code & (1 << bit) != 0)
            .fold(PacketErrors::empty(), |acc, (_, flag)| acc | *flag)
    }

    /// Build the status of a result from its last segment's control word and
    /// output token.
    pub fn translate(&self, control: u32, token: Option<&OutputToken>) -> ResultStatus {
        let mut status = ResultStatus::default();

        let flags = SegmentFlags::from_bits_truncate(control);
        if flags.contains(SegmentFlags::DESC_OVERFLOW) {
            status.errors |= PacketErrors::DESCRIPTOR_OVERFLOW;
        }
        if flags.contains(SegmentFlags::BUF_OVERFLOW) {
            status.errors |= PacketErrors::BUFFER_OVERFLOW;
        }

        if let Some(token) = token {
            status.errors |= self.errors(token.error_code);
            status.pad_byte_count = token.pad_byte_count;
            status.next_header = token.next_header;
        }
        status
    }
}

impl Default for StatusMap {
    fn default() -> Self {
        Self::EIP96
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::control_word;

    #[test]
    fn test_eip96_remap() {
        let map = StatusMap::EIP96;
        assert_eq!(map.errors(1 << 9), PacketErrors::AUTH);
        assert_eq!(map.errors(1 << 0), PacketErrors::LENGTH);
        assert_eq!(map.errors(1 << 14), PacketErrors::TIMEOUT);
        assert_eq!(
            map.errors((1 << 10) | (1 << 11)),
            PacketErrors::SEQUENCE | PacketErrors::SPI
        );
        assert_eq!(
            map.errors(1 << 12),
            PacketErrors::CHECKSUM | PacketErrors::PAD
        );
        // bit 13 is not reported by the device
        assert_eq!(map.errors(1 << 13), PacketErrors::empty());
    }

    #[test]
    fn test_identity_map() {
        let bits = (PacketErrors::AUTH | PacketErrors::TIMEOUT).bits();
        assert_eq!(
            StatusMap::IDENTITY.errors(bits),
            PacketErrors::AUTH | PacketErrors::TIMEOUT
        );
    }

    #[test]
    fn test_translate_overflow_bits_and_token_fields() {
        let control = control_word(
            64,
            SegmentFlags::LAST | SegmentFlags::BUF_OVERFLOW | SegmentFlags::DESC_OVERFLOW,
        );
        let token = OutputToken {
            packet_length: 64,
            error_code: 1 << 9,
            pad_byte_count: 6,
            next_header: 50,
            ..Default::default()
        };

        let status = StatusMap::EIP96.translate(control, Some(&token));
        assert_eq!(
            status.errors,
            PacketErrors::AUTH
                | PacketErrors::BUFFER_OVERFLOW
                | PacketErrors::DESCRIPTOR_OVERFLOW
        );
        assert_eq!(status.pad_byte_count, 6);
        assert_eq!(status.next_header, 50);
        assert!(!status.is_ok());
    }

    #[test]
    fn test_translate_clean_result() {
        let control = control_word(64, SegmentFlags::FIRST | SegmentFlags::LAST);
        assert!(StatusMap::EIP96.translate(control, None).is_ok());
    }
}
