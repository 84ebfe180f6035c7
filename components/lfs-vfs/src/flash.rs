use std::{
    fs::File,
    io::{self, Read as _, Seek as _, SeekFrom, Write as _},
};

use log::trace;
use vfs::{Error, Result};

use crate::{cipher::BlockCipher, geometry::Geometry};

/// Value of every byte of an erased flash block.
pub const ERASED_BYTE: u8 = 0xff;

/// What the image file stands for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Medium {
    /// Plain file: erasing a block writes [`ERASED_BYTE`] over it.
    #[default]
    ImageFile,
    /// Physical flash, already erased by the hardware: erase does nothing.
    RawFlash,
}

#[derive(Clone, Copy)]
enum Transform {
    Encrypt,
    Decrypt,
}

/// Block device handed to the filesystem engine, backed by an image file.
///
/// File positions are relative to the filesystem region. Cipher IVs are
/// derived from the absolute flash offset, i.e. the file position plus
/// `base_offset`.
pub struct ImageFlash {
    file: File,
    block_size: u32,
    io_size: u32,
    base_offset: u64,
    cipher: Option<BlockCipher>,
    medium: Medium,
    scratch: Vec<u8>,
    erased: Vec<u8>,
}

impl ImageFlash {
    pub fn new(
        file: File,
        geometry: &Geometry,
        cipher: Option<BlockCipher>,
        base_offset: u64,
        medium: Medium,
    ) -> Self {
        Self {
            file,
            block_size: geometry.block_size,
            io_size: geometry.io_size,
            base_offset,
            cipher,
            medium,
            scratch: Vec::new(),
            erased: vec![ERASED_BYTE; geometry.block_size as usize],
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    fn image_offset(&self, block: u32, off: u32) -> u64 {
        u64::from(block) * u64::from(self.block_size) + u64::from(off)
    }

    pub fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        let offset = self.image_offset(block, off);
        trace!("read {:#x} {:#x}", offset, buf.len());

        self.file.seek(SeekFrom::Start(offset))?;
        let transferred = read_full(&mut self.file, buf)?;
        if transferred != buf.len() {
            return Err(Error::ShortTransfer {
                requested: buf.len(),
                transferred,
            });
        }

        if let Some(cipher) = &self.cipher {
            transform_units(
                cipher,
                self.io_size as usize,
                offset + self.base_offset,
                buf,
                Transform::Decrypt,
            )?;
        }
        Ok(())
    }

    pub fn prog(&mut self, block: u32, off: u32, data: &[u8]) -> Result<()> {
        let offset = self.image_offset(block, off);
        trace!("prog {:#x} {:#x}", offset, data.len());

        let data = match &self.cipher {
            Some(cipher) => {
                self.scratch.clear();
                self.scratch.extend_from_slice(data);
                transform_units(
                    cipher,
                    self.io_size as usize,
                    offset + self.base_offset,
                    &mut self.scratch,
                    Transform::Encrypt,
                )?;
                &self.scratch[..]
            }
            None => data,
        };

        self.file.seek(SeekFrom::Start(offset))?;
        let transferred = write_full(&mut self.file, data)?;
        if transferred != data.len() {
            return Err(Error::ShortTransfer {
                requested: data.len(),
                transferred,
            });
        }
        Ok(())
    }

    pub fn erase(&mut self, block: u32) -> Result<()> {
        if self.medium == Medium::RawFlash {
            return Ok(());
        }
        let offset = self.image_offset(block, 0);
        trace!("erase {:#x} {:#x}", offset, self.block_size);
        self.write_erased(offset)
    }

    /// Fills `block_count` blocks with [`ERASED_BYTE`] regardless of the
    /// medium, leaving the image as virgin flash.
    pub fn fill_erased(&mut self, block_count: u32) -> Result<()> {
        for block in 0..block_count {
            self.write_erased(self.image_offset(block, 0))?;
        }
        self.sync()
    }

    fn write_erased(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        let transferred = write_full(&mut self.file, &self.erased)?;
        if transferred != self.erased.len() {
            return Err(Error::ShortTransfer {
                requested: self.erased.len(),
                transferred,
            });
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Applies the cipher to every I/O unit of `buf` separately, so chaining
/// never crosses a unit boundary.
fn transform_units(
    cipher: &BlockCipher,
    io_size: usize,
    absolute: u64,
    buf: &mut [u8],
    transform: Transform,
) -> Result<()> {
    if buf.len() % io_size != 0 {
        return Err(Error::Crypto(format!(
            "block length mismatch: {} is not a multiple of {io_size}",
            buf.len()
        )));
    }
    for (index, unit) in buf.chunks_mut(io_size).enumerate() {
        let offset = absolute + (index * io_size) as u64;
        match transform {
            Transform::Encrypt => cipher.encrypt(offset, unit)?,
            Transform::Decrypt => cipher.decrypt(offset, unit)?,
        }
    }
    Ok(())
}

fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn write_full(file: &mut File, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match file.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(written)
}
