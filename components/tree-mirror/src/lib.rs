//! Recursive copy of a directory tree from one [`Vfs`] to another.
//!
//! The same traversal serves both directions of the image tool: host tree
//! into a littlefs image, and littlefs image out to a host tree. Which is
//! which only depends on the backend passed as `source` and `destination`.
//!
//! # Traversal
//! For every directory, depth first:
//! * the directory is created on the destination (existing ones are reused)
//! * its entries are read from the source in backend order
//! * files are copied through a transfer buffer, directories other than
//!   `.` and `..` are descended into
//!
//! The first failure stops the whole traversal. Handles are released in
//! reverse order of acquisition on every path; failures while releasing are
//! logged and never hide the error that stopped the run.

use log::{debug, error, info, warn};
use vfs::{EntryKind, Error, OpenFlags, Result, Vfs};

pub const TRANSFER_BUFFER_SIZE: usize = 4096;

/// What a run copied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Directories visited, the root included.
    pub directories: usize,
    pub files: usize,
    pub bytes: u64,
}

pub struct TreeMirror<S, D> {
    source: S,
    destination: D,
    buffer_size: usize,
}

impl<S: Vfs, D: Vfs> TreeMirror<S, D> {
    pub fn new(source: S, destination: D) -> Self {
        Self {
            source,
            destination,
            buffer_size: TRANSFER_BUFFER_SIZE,
        }
    }

    /// Size of the per-file transfer buffer, at least one byte.
    pub fn buffer_size(self, buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            ..self
        }
    }

    pub fn into_inner(self) -> (S, D) {
        (self.source, self.destination)
    }

    /// Mirrors the tree below `root`, creating `root` itself on the
    /// destination first.
    pub fn run(&mut self, root: &str) -> Result<Stats> {
        let mut stats = Stats::default();
        self.mirror_dir(root, &mut stats)?;
        info!(
            "mirrored {} directories, {} files, {} bytes",
            stats.directories, stats.files, stats.bytes
        );
        Ok(stats)
    }

    fn mirror_dir(&mut self, path: &str, stats: &mut Stats) -> Result<()> {
        info!("dir {}", path);
        self.destination.mkdir(path)?;
        let mut dir = self.source.open_dir(path)?;
        stats.directories += 1;

        let result = self.mirror_entries(path, &mut dir, stats);
        if let Err(err) = self.source.close_dir(dir) {
            warn!("closing source dir {} failed: {}", path, err);
        }
        result
    }

    fn mirror_entries(&mut self, path: &str, dir: &mut S::Dir, stats: &mut Stats) -> Result<()> {
        while let Some(entry) = self.source.read_dir(dir)? {
            let child = vfs::join(path, entry.name());
            match entry.kind() {
                EntryKind::File => self.mirror_file(&child, stats)?,
                EntryKind::Directory if vfs::is_pseudo_entry(entry.name()) => {}
                EntryKind::Directory => self.mirror_dir(&child, stats)?,
            }
        }
        Ok(())
    }

    fn mirror_file(&mut self, path: &str, stats: &mut Stats) -> Result<()> {
        info!("file {}", path);
        let mut output = self.destination.open(
            path,
            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE_ONLY,
        )?;
        let mut input = match self.source.open(path, OpenFlags::READ_ONLY) {
            Ok(input) => input,
            Err(err) => {
                if let Err(close_err) = self.destination.close(output) {
                    warn!("closing destination file {} failed: {}", path, close_err);
                }
                return Err(err);
            }
        };

        let copied = self.copy(&mut input, &mut output);
        if let Err(err) = self.source.close(input) {
            warn!("closing source file {} failed: {}", path, err);
        }
        // the destination only holds the data once its close succeeded
        match (copied, self.destination.close(output)) {
            (Ok(bytes), Ok(())) => {
                debug!("{}: {} bytes", path, bytes);
                stats.files += 1;
                stats.bytes += bytes;
                Ok(())
            }
            (Ok(_), Err(err)) => {
                error!("closing destination file {} failed: {}", path, err);
                Err(err)
            }
            (Err(err), closed) => {
                error!("copying {} failed: {}", path, err);
                if let Err(close_err) = closed {
                    warn!("closing destination file {} failed: {}", path, close_err);
                }
                Err(err)
            }
        }
    }

    fn copy(&mut self, input: &mut S::File, output: &mut D::File) -> Result<u64> {
        let mut buffer = vec![0; self.buffer_size];
        let mut total = 0;
        loop {
            let read = self.source.read(input, &mut buffer)?;
            if read > 0 {
                let written = self.destination.write(output, &buffer[..read])?;
                if written != read {
                    return Err(Error::ShortTransfer {
                        requested: read,
                        transferred: written,
                    });
                }
                total += read as u64;
            }
            if read < buffer.len() {
                return Ok(total);
            }
        }
    }
}
