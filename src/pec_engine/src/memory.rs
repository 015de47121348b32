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

//! DMA memory access.
//!
//! This module defines the [`DmaMemory`] trait through which the engine and
//! ring backends touch DMA-visible memory. Addresses are bus addresses: the
//! values written into ring descriptors. Host-side mappings are the
//! implementation's business.

use bytemuck::Pod;

/// Scratch size used by the default [`DmaMemory::copy`].
const COPY_CHUNK: usize = 256;

/// Backend-provided access to DMA-visible memory.
pub trait DmaMemory {
    type Error: core::fmt::Debug;

    /// Read bytes starting at bus address `addr`.
    ///
    /// # Returns
    ///
    /// Number of bytes actually read (should equal `dst.len()` on success).
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write bytes starting at bus address `addr`.
    ///
    /// # Returns
    ///
    /// Number of bytes actually written (should equal `src.len()` on success).
    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error>;

    /// Make `len` bytes at `addr` visible to the device before a transfer.
    ///
    /// Cache-coherent implementations leave this as a no-op.
    fn sync_for_device(&self, _addr: u64, _len: usize) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Make `len` bytes at `addr` written by the device visible to the host.
    fn sync_for_host(&self, _addr: u64, _len: usize) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Copy `len` bytes from `from` to `to`. Ranges must not overlap.
    fn copy(&self, from: u64, to: u64, len: usize) -> Result<(), Self::Error> {
        let mut scratch = [0u8; COPY_CHUNK];
        let mut done = 0;

        while done < len {
            let n = (len - done).min(COPY_CHUNK);
            let off = done as u64;
            self.read(from + off, &mut scratch[..n])?;
            self.write(to + off, &scratch[..n])?;
            done += n;
        }

        Ok(())
    }

    /// Read a Pod type at the given address.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod type at the given address.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }
}
