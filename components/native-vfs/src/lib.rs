//! [`Vfs`] backend over the host filesystem, rooted at a directory.
//!
//! Every interface path is resolved relative to the configured root, so `/`
//! is the root itself and `/a/b` is `<root>/a/b`. Paths that would leave the
//! root through `..` are rejected.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read as _, Write as _},
    path::{Component, Path, PathBuf},
};

use log::{debug, error};
use vfs::{DirEntry, EntryKind, Error, OpenFlags, Result, Vfs};

pub struct NativeVfs {
    root: PathBuf,
    mounted: bool,
}

pub struct NativeFile {
    file: File,
    path: PathBuf,
}

pub struct NativeDir {
    entries: fs::ReadDir,
    path: PathBuf,
}

impl NativeVfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounted: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, path: &str) -> Result<PathBuf> {
        if !self.mounted {
            return Err(Error::NotMounted);
        }
        let relative = Path::new(path.trim_start_matches(vfs::SEPARATOR));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::InvalidArgument(format!("{path}: escapes the root")));
        }
        if relative.as_os_str().is_empty() {
            Ok(self.root.clone())
        } else {
            Ok(self.root.join(relative))
        }
    }
}

fn io_error(err: io::Error, path: &Path) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::NotFound(path.display().to_string())
    } else {
        Error::Io(err)
    }
}

impl Vfs for NativeVfs {
    type File = NativeFile;
    type Dir = NativeDir;

    fn mount(&mut self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("empty root directory".into()));
        }
        if self.root.exists() && !self.root.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "{}: not a directory",
                self.root.display()
            )));
        }
        debug!("native root: {}", self.root.display());
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Err(Error::NotMounted);
        }
        self.mounted = false;
        Ok(())
    }

    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<NativeFile> {
        let path = self.host_path(path)?;
        let file = OpenOptions::new()
            .read(flags.readable())
            .write(flags.writable())
            .append(flags.contains(OpenFlags::APPEND))
            .create(flags.contains(OpenFlags::CREATE))
            .truncate(flags.contains(OpenFlags::TRUNCATE))
            .open(&path)
            .map_err(|err| {
                error!("open({}, {:?}) failed: {}", path.display(), flags, err);
                io_error(err, &path)
            })?;
        Ok(NativeFile { file, path })
    }

    fn close(&mut self, mut file: NativeFile) -> Result<()> {
        // the descriptor is released when `file` drops, whatever flush returns
        file.file.flush().map_err(|err| {
            error!("close({}) failed: {}", file.path.display(), err);
            Error::Io(err)
        })
    }

    fn read(&mut self, file: &mut NativeFile, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match file.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("read({}) failed: {}", file.path.display(), err);
                    return Err(Error::Io(err));
                }
            }
        }
        Ok(filled)
    }

    fn write(&mut self, file: &mut NativeFile, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match file.file.write(&buf[written..]) {
                Ok(0) => {
                    error!("write({}) stalled at {written} bytes", file.path.display());
                    return Err(Error::ShortTransfer {
                        requested: buf.len(),
                        transferred: written,
                    });
                }
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("write({}) failed: {}", file.path.display(), err);
                    return Err(Error::Io(err));
                }
            }
        }
        Ok(written)
    }

    fn open_dir(&mut self, path: &str) -> Result<NativeDir> {
        let path = self.host_path(path)?;
        let entries = fs::read_dir(&path).map_err(|err| {
            error!("opendir({}) failed: {}", path.display(), err);
            io_error(err, &path)
        })?;
        Ok(NativeDir { entries, path })
    }

    fn close_dir(&mut self, _dir: NativeDir) -> Result<()> {
        Ok(())
    }

    fn read_dir(&mut self, dir: &mut NativeDir) -> Result<Option<DirEntry>> {
        // the iterator ends with `None`; OS errors while enumerating come back as `Err`
        let entry = match dir.entries.next() {
            None => return Ok(None),
            Some(entry) => entry.map_err(|err| {
                error!("readdir({}) failed: {}", dir.path.display(), err);
                Error::Io(err)
            })?,
        };

        let path = entry.path();
        let metadata = fs::metadata(&path).map_err(|err| {
            error!("stat({}) failed: {}", path.display(), err);
            io_error(err, &path)
        })?;
        let kind = if metadata.is_file() {
            EntryKind::File
        } else if metadata.is_dir() {
            EntryKind::Directory
        } else {
            error!("readdir({}): unsupported entry type", path.display());
            return Err(Error::UnsupportedEntry(path.display().to_string()));
        };

        let name = entry.file_name().into_string().map_err(|name| {
            Error::InvalidArgument(format!("{}: name is not UTF-8", name.to_string_lossy()))
        })?;
        DirEntry::new(name, kind).map(Some)
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        let path = self.host_path(path)?;
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt as _;
            builder.mode(0o777);
        }
        match builder.create(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                debug!("mkdir({}): already exists", path.display());
                Ok(())
            }
            Err(err) => {
                error!("mkdir({}) failed: {}", path.display(), err);
                Err(io_error(err, &path))
            }
        }
    }
}

#[cfg(test)]
mod tests;
