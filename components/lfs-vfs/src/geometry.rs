use memory_regions::MemoryRegions;
use vfs::{Error, Result};

use crate::cipher;

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const DEFAULT_IO_SIZE: u32 = 256;
pub const DEFAULT_BLOCK_COUNT: u32 =
    MemoryRegions::EXTERNAL_FLASH.block_count(DEFAULT_BLOCK_SIZE as usize) as u32;

/// Longest name the engine was built for (LFS_NAME_MAX).
pub const ENGINE_NAME_MAX: u32 = 255;

const MIN_BLOCK_SIZE: u32 = 128;

/// Layout of the flash as seen by the filesystem engine.
///
/// The device tool uses one value for the read and program granularity, the
/// cache and the lookahead buffer; [`Geometry::with_io_size`] keeps them in
/// step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Erase granularity in bytes.
    pub block_size: u32,
    /// Read and program granularity in bytes.
    pub io_size: u32,
    pub cache_size: u32,
    /// Lookahead buffer size in bytes, a multiple of 8.
    pub lookahead_size: u32,
    pub block_count: u32,
    /// Maximum entry name length, 0 selects [`ENGINE_NAME_MAX`].
    pub name_max: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            io_size: DEFAULT_IO_SIZE,
            cache_size: DEFAULT_IO_SIZE,
            lookahead_size: DEFAULT_IO_SIZE,
            block_count: DEFAULT_BLOCK_COUNT,
            name_max: 0,
        }
    }
}

impl Geometry {
    pub fn with_io_size(self, io_size: u32) -> Self {
        Self {
            io_size,
            cache_size: io_size,
            lookahead_size: io_size,
            ..self
        }
    }

    /// Size of the filesystem region in bytes.
    pub fn image_len(&self) -> u64 {
        u64::from(self.block_count) * u64::from(self.block_size)
    }

    pub fn validate(&self, encrypted: bool) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidArgument(msg));

        if self.block_size < MIN_BLOCK_SIZE {
            return invalid(format!(
                "block size {} is below {MIN_BLOCK_SIZE}",
                self.block_size
            ));
        }
        if self.io_size == 0 || self.block_size % self.io_size != 0 {
            return invalid(format!(
                "io size {} does not divide block size {}",
                self.io_size, self.block_size
            ));
        }
        if self.cache_size == 0
            || self.cache_size % self.io_size != 0
            || self.block_size % self.cache_size != 0
        {
            return invalid(format!(
                "cache size {} must be a multiple of io size {} and divide block size {}",
                self.cache_size, self.io_size, self.block_size
            ));
        }
        if self.lookahead_size == 0 || self.lookahead_size % 8 != 0 {
            return invalid(format!(
                "lookahead size {} is not a multiple of 8",
                self.lookahead_size
            ));
        }
        if self.block_count < 2 {
            return invalid(format!("block count {} is below 2", self.block_count));
        }
        if self.name_max > ENGINE_NAME_MAX {
            return invalid(format!(
                "name max {} exceeds {ENGINE_NAME_MAX}",
                self.name_max
            ));
        }
        if encrypted && self.io_size as usize % cipher::BLOCK_LEN != 0 {
            return invalid(format!(
                "io size {} is not a multiple of the cipher block ({})",
                self.io_size,
                cipher::BLOCK_LEN
            ));
        }
        Ok(())
    }
}
