//! littlefs image files as a [`vfs::Vfs`] backend.
//!
//! The image holds the filesystem region of the device flash, i.e. everything
//! after the reserved area described by `memory-regions`. The engine accesses
//! it through an [`ImageFlash`], which optionally encrypts every I/O unit with
//! AES-128-CBC.
//!
//! # Image Layout
//! ```text
//! flash:  | reserved (base_offset bytes) | block 0 | block 1 | … | block n-1 |
//! image:                                 | block 0 | block 1 | … | block n-1 |
//! ```
//! Block `b` at intra-block offset `o` is stored at image offset
//! `b * block_size + o`. Its IV is derived from `base_offset + b * block_size
//! + o`, so an image written by this crate matches the on-device flash
//! contents byte for byte.
//!
//! # Important Implementation Details
//! * Every engine read and program is a multiple of the I/O unit. Each unit
//!   is encrypted on its own, chaining never crosses a unit boundary
//! * In [`MountMode::Format`] the whole region is filled with `0xff` before
//!   the engine formats it, so unused blocks look like erased flash
//! * Handles carry the id of the mount they were opened on; using one after
//!   a remount fails with [`vfs::Error::InvalidArgument`]

mod cipher;
mod engine;
mod flash;
mod geometry;
mod lfs_vfs;

pub use crate::cipher::{BlockCipher, BLOCK_LEN, IV_SIZE, KEY_SIZE, KEY_TABLE_SIZE};
pub use crate::flash::{ImageFlash, Medium, ERASED_BYTE};
pub use crate::geometry::{
    Geometry, DEFAULT_BLOCK_COUNT, DEFAULT_BLOCK_SIZE, DEFAULT_IO_SIZE, ENGINE_NAME_MAX,
};
pub use crate::lfs_vfs::*;
