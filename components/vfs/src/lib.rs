//! Storage capability interface shared by the host and flash backends.
//!
//! Both a native directory tree and a littlefs image are driven through the
//! [`Vfs`] trait, so a single traversal can copy a tree from one to the other
//! in either direction.
//!
//! # Handles
//! Open files and directories are represented by the backend's associated
//! `File` and `Dir` types. `close` and `close_dir` consume the handle, so a
//! retired handle cannot be used again.
//!
//! # Reading
//! * `read` fills the whole buffer unless it reaches the end of the file; a
//!   short count is the caller's signal that the file is exhausted
//! * `read_dir` returns `Ok(None)` once the directory is exhausted, which is
//!   distinct from both an entry and an error

mod error;
mod path;

use bitflags::bitflags;

pub use crate::error::{Error, Result};
pub use crate::path::{is_pseudo_entry, join, SEPARATOR};

/// Upper bound (exclusive) for the length of an entry name in bytes.
pub const MAX_NAME_LEN: usize = 512;

bitflags! {
    /// Portable open flags, translated by every backend to its own flag set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ_ONLY = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_WRITE = 1 << 2;
        const CREATE = 1 << 3;
        const TRUNCATE = 1 << 4;
        const APPEND = 1 << 5;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        self.intersects(Self::READ_ONLY | Self::READ_WRITE)
    }

    pub fn writable(self) -> bool {
        self.intersects(Self::WRITE_ONLY | Self::READ_WRITE)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    name: String,
    kind: EntryKind,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() >= MAX_NAME_LEN {
            return Err(Error::InvalidArgument(format!(
                "entry name length {} out of range",
                name.len()
            )));
        }
        Ok(Self { name, kind })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

pub trait Vfs {
    /// An open file, valid until passed to `close`.
    type File;
    /// An open directory cursor, valid until passed to `close_dir`.
    type Dir;

    fn mount(&mut self) -> Result<()>;
    fn unmount(&mut self) -> Result<()>;

    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Self::File>;
    /// Retires `file` even if flushing it fails; the failure is still reported.
    fn close(&mut self, file: Self::File) -> Result<()>;
    /// Returns the number of bytes placed in `buf`. Less than `buf.len()`
    /// means the end of the file was reached.
    fn read(&mut self, file: &mut Self::File, buf: &mut [u8]) -> Result<usize>;
    /// Writes all of `buf` or fails.
    fn write(&mut self, file: &mut Self::File, buf: &[u8]) -> Result<usize>;

    fn open_dir(&mut self, path: &str) -> Result<Self::Dir>;
    fn close_dir(&mut self, dir: Self::Dir) -> Result<()>;
    /// Next entry in backend order, `Ok(None)` at the end of the directory.
    fn read_dir(&mut self, dir: &mut Self::Dir) -> Result<Option<DirEntry>>;

    /// Creates `path`. An existing directory is not an error.
    fn mkdir(&mut self, path: &str) -> Result<()>;
}

impl<T: Vfs + ?Sized> Vfs for &mut T {
    type File = T::File;
    type Dir = T::Dir;

    fn mount(&mut self) -> Result<()> {
        (**self).mount()
    }

    fn unmount(&mut self) -> Result<()> {
        (**self).unmount()
    }

    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Self::File> {
        (**self).open(path, flags)
    }

    fn close(&mut self, file: Self::File) -> Result<()> {
        (**self).close(file)
    }

    fn read(&mut self, file: &mut Self::File, buf: &mut [u8]) -> Result<usize> {
        (**self).read(file, buf)
    }

    fn write(&mut self, file: &mut Self::File, buf: &[u8]) -> Result<usize> {
        (**self).write(file, buf)
    }

    fn open_dir(&mut self, path: &str) -> Result<Self::Dir> {
        (**self).open_dir(path)
    }

    fn close_dir(&mut self, dir: Self::Dir) -> Result<()> {
        (**self).close_dir(dir)
    }

    fn read_dir(&mut self, dir: &mut Self::Dir) -> Result<Option<DirEntry>> {
        (**self).read_dir(dir)
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        (**self).mkdir(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_name_bounds() {
        assert!(DirEntry::new("", EntryKind::File).is_err());
        assert!(DirEntry::new("x".repeat(MAX_NAME_LEN), EntryKind::File).is_err());

        let entry = DirEntry::new("x".repeat(MAX_NAME_LEN - 1), EntryKind::Directory).unwrap();
        assert!(entry.is_dir());
        assert!(!entry.is_file());
    }

    #[test]
    fn access_modes() {
        assert!(OpenFlags::READ_ONLY.readable());
        assert!(!OpenFlags::READ_ONLY.writable());
        let flags = OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE_ONLY;
        assert!(flags.writable());
        assert!(!flags.readable());
        assert!(OpenFlags::READ_WRITE.readable() && OpenFlags::READ_WRITE.writable());
    }
}
