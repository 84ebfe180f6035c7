#![no_std]

use core::ops::Range;

/// Layout of a flash device: a reserved area (header, bootloader) followed
/// by the region managed by the filesystem.
pub struct MemoryRegions {
    pub reserved: Range<usize>,
    pub filesystem: Range<usize>,
}

impl MemoryRegions {
    /// 16 MiB external flash with the filesystem starting at 0x25_000.
    pub const EXTERNAL_FLASH: Self = Self::split(0..0x100_0000, 0x25_000);

    pub const fn split(region: Range<usize>, boundary: usize) -> Self {
        assert!(region.start <= boundary && boundary <= region.end);
        Self {
            reserved: region.start..boundary,
            filesystem: boundary..region.end,
        }
    }

    /// Offset of the filesystem region from the start of the flash.
    pub const fn base_offset(&self) -> usize {
        self.filesystem.start
    }

    /// Number of whole blocks of `block_size` bytes in the filesystem region.
    pub const fn block_count(&self, block_size: usize) -> usize {
        (self.filesystem.end - self.filesystem.start) / block_size
    }
}
