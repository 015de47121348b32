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

use core::cmp::{max, min};

use crate::descriptor::BYTE_COUNT_MASK;

/// Per-interface ring configuration, handed to [`init`](crate::PacketEngine::init)
/// and forwarded to the ring backend.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
#[repr(C)]
pub struct RingConfig {
    /// Let the device fetch security contexts on demand instead of requiring
    /// them to be resident.
    use_dynamic_context: bool,
    /// Fixed size of every preloaded scatter fragment in continuous scatter
    /// mode. 0 means "use the size of each preloaded buffer".
    fixed_scatter_fragment_size: u32,
    /// Streaming mode: destination buffers are preloaded with
    /// [`scatter_preload`](crate::PacketEngine::scatter_preload) and
    /// results are spread over them by the device.
    continuous_scatter: bool,
}

impl RingConfig {
    /// The default fixed scatter fragment size (disabled)
    pub const DEFAULT_FIXED_SCATTER_FRAGMENT_SIZE: u32 = 0;
    /// The minimum non-zero fixed scatter fragment size
    pub const MIN_FIXED_SCATTER_FRAGMENT_SIZE: u32 = 64;
    /// The maximum fixed scatter fragment size, bounded by the descriptor byte count field
    pub const MAX_FIXED_SCATTER_FRAGMENT_SIZE: u32 = BYTE_COUNT_MASK;

    pub fn set_use_dynamic_context(&mut self, enable: bool) {
        self.use_dynamic_context = enable;
    }

    pub fn use_dynamic_context(&self) -> bool {
        self.use_dynamic_context
    }

    /// Set the fixed scatter fragment size. Non-zero values are clamped to
    /// `[MIN_FIXED_SCATTER_FRAGMENT_SIZE, MAX_FIXED_SCATTER_FRAGMENT_SIZE]`.
    pub fn set_fixed_scatter_fragment_size(&mut self, size: u32) {
        self.fixed_scatter_fragment_size = match size {
            0 => 0,
            1.. => min(
                Self::MAX_FIXED_SCATTER_FRAGMENT_SIZE,
                max(size, Self::MIN_FIXED_SCATTER_FRAGMENT_SIZE),
            ),
        };
        if self.fixed_scatter_fragment_size != size {
            log::warn!(
                "fixed scatter fragment size {} clamped to {}",
                size,
                self.fixed_scatter_fragment_size
            );
        }
    }

    pub fn fixed_scatter_fragment_size(&self) -> u32 {
        self.fixed_scatter_fragment_size
    }

    pub fn set_continuous_scatter(&mut self, enable: bool) {
        self.continuous_scatter = enable;
    }

    pub fn continuous_scatter(&self) -> bool {
        self.continuous_scatter
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            use_dynamic_context: false,
            fixed_scatter_fragment_size: Self::DEFAULT_FIXED_SCATTER_FRAGMENT_SIZE,
            continuous_scatter: false,
        }
    }
}

/// Engine-wide configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EngineConfig {
    /// Bus address of the DMA pool bounce buffers are carved from.
    dma_pool_base: u64,
    /// Size of the DMA pool in bytes.
    dma_pool_size: usize,
    /// Copy foreign buffers through bounce buffers. When disabled, foreign
    /// buffers are handed to the device as they are.
    bounce_buffers: bool,
}

impl EngineConfig {
    /// The default DMA pool size (1MiB)
    pub const DEFAULT_DMA_POOL_SIZE: usize = 1024 * 1024;
    /// The minimum DMA pool size; smaller pools cannot hold both slab tiers
    pub const MIN_DMA_POOL_SIZE: usize = 64 * 1024;
    /// The maximum DMA pool size (256MiB)
    pub const MAX_DMA_POOL_SIZE: usize = 256 * 1024 * 1024;

    /// Create a configuration for a DMA pool at `dma_pool_base`.
    pub fn new(dma_pool_base: u64, dma_pool_size: usize) -> Self {
        let mut config = Self {
            dma_pool_base,
            dma_pool_size: Self::DEFAULT_DMA_POOL_SIZE,
            bounce_buffers: true,
        };
        config.set_dma_pool_size(dma_pool_size);
        config
    }

    pub fn dma_pool_base(&self) -> u64 {
        self.dma_pool_base
    }

    /// Set the DMA pool size, clamped to `[MIN_DMA_POOL_SIZE, MAX_DMA_POOL_SIZE]`.
    pub fn set_dma_pool_size(&mut self, size: usize) {
        self.dma_pool_size = min(Self::MAX_DMA_POOL_SIZE, max(size, Self::MIN_DMA_POOL_SIZE));
    }

    pub fn dma_pool_size(&self) -> usize {
        self.dma_pool_size
    }

    pub fn set_bounce_buffers(&mut self, enable: bool) {
        self.bounce_buffers = enable;
    }

    pub fn bounce_buffers(&self) -> bool {
        self.bounce_buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_config_defaults() {
        let config = RingConfig::default();
        assert!(!config.use_dynamic_context());
        assert!(!config.continuous_scatter());
        assert_eq!(
            config.fixed_scatter_fragment_size(),
            RingConfig::DEFAULT_FIXED_SCATTER_FRAGMENT_SIZE
        );
    }

    #[test]
    fn test_fragment_size_clamping() {
        let mut config = RingConfig::default();
        config.set_fixed_scatter_fragment_size(1);
        assert_eq!(
            config.fixed_scatter_fragment_size(),
            RingConfig::MIN_FIXED_SCATTER_FRAGMENT_SIZE
        );

        config.set_fixed_scatter_fragment_size(u32::MAX);
        assert_eq!(
            config.fixed_scatter_fragment_size(),
            RingConfig::MAX_FIXED_SCATTER_FRAGMENT_SIZE
        );

        config.set_fixed_scatter_fragment_size(2048);
        assert_eq!(config.fixed_scatter_fragment_size(), 2048);

        config.set_fixed_scatter_fragment_size(0);
        assert_eq!(config.fixed_scatter_fragment_size(), 0);
    }

    #[test]
    fn test_dma_pool_size_clamping() {
        let config = EngineConfig::new(0x1000_0000, 1);
        assert_eq!(config.dma_pool_size(), EngineConfig::MIN_DMA_POOL_SIZE);
        assert!(config.bounce_buffers());

        let config = EngineConfig::new(0x1000_0000, usize::MAX);
        assert_eq!(config.dma_pool_size(), EngineConfig::MAX_DMA_POOL_SIZE);

        let mut config = EngineConfig::new(0x1000_0000, 512 * 1024);
        assert_eq!(config.dma_pool_size(), 512 * 1024);
        config.set_bounce_buffers(false);
        assert!(!config.bounce_buffers());
    }
}
