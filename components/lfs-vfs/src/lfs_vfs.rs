use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    io,
    path::PathBuf,
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use log::{debug, error, info, warn};
use memory_regions::MemoryRegions;
use vfs::{DirEntry, Error, OpenFlags, Result, Vfs};

use crate::{
    cipher::BlockCipher,
    engine::{DirState, Engine, FileState},
    flash::{ImageFlash, Medium},
    geometry::Geometry,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountMode {
    /// Erase the image region, create a fresh filesystem and mount it.
    Format,
    /// Mount an existing image without writing to it.
    ReadOnly,
    /// Mount an existing image for modification in place.
    ReadWrite,
}

impl MountMode {
    fn writable(self) -> bool {
        self != Self::ReadOnly
    }
}

#[derive(Clone, Debug)]
pub struct ImageConfig {
    pub path: PathBuf,
    pub mode: MountMode,
    pub geometry: Geometry,
    pub cipher: Option<BlockCipher>,
    /// Absolute flash offset of the first image byte, mixed into the IVs.
    pub base_offset: u64,
    pub medium: Medium,
}

impl ImageConfig {
    pub fn new(path: impl Into<PathBuf>, mode: MountMode) -> Self {
        Self {
            path: path.into(),
            mode,
            geometry: Geometry::default(),
            cipher: None,
            base_offset: MemoryRegions::EXTERNAL_FLASH.base_offset() as u64,
            medium: Medium::default(),
        }
    }

    pub fn geometry(self, geometry: Geometry) -> Self {
        Self { geometry, ..self }
    }

    pub fn cipher(self, cipher: Option<BlockCipher>) -> Self {
        Self { cipher, ..self }
    }

    pub fn base_offset(self, base_offset: u64) -> Self {
        Self {
            base_offset,
            ..self
        }
    }

    pub fn medium(self, medium: Medium) -> Self {
        Self { medium, ..self }
    }
}

/// Source of instance ids. A handle records the instance that opened it and
/// is refused, never freed, by any other.
static INSTANCE_IDS: AtomicU64 = AtomicU64::new(1);

/// Source of mount ids, telling a handle of an earlier mount of the same
/// instance apart from a live one.
static MOUNT_IDS: AtomicU64 = AtomicU64::new(1);

struct Mounted {
    engine: Engine,
    generation: u64,
}

/// [`Vfs`] backend over a littlefs image file.
pub struct LfsVfs {
    config: ImageConfig,
    instance: u64,
    mounted: Option<Mounted>,
}

/// Open file of an [`LfsVfs`]. Dropping it without `close`, or handing it to
/// another instance, leaks its state.
pub struct LfsFile {
    state: NonNull<FileState>,
    instance: u64,
    generation: u64,
    path: String,
}

/// Open directory of an [`LfsVfs`]. Dropping it without `close_dir` leaks
/// its state.
pub struct LfsDir {
    state: NonNull<DirState>,
    instance: u64,
    generation: u64,
    path: String,
}

fn c_path(path: &str) -> Result<CString> {
    CString::new(path).map_err(|_| Error::InvalidArgument(format!("{path:?}: contains NUL")))
}

impl LfsVfs {
    pub fn new(config: ImageConfig) -> Self {
        Self {
            config,
            instance: INSTANCE_IDS.fetch_add(1, Ordering::Relaxed),
            mounted: None,
        }
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    fn open_image(&self) -> Result<File> {
        let config = &self.config;
        let mut options = OpenOptions::new();
        options.read(true);
        match config.mode {
            MountMode::Format => {
                options
                    .write(true)
                    .create(true)
                    .truncate(config.medium == Medium::ImageFile);
            }
            MountMode::ReadWrite => {
                options.write(true);
            }
            MountMode::ReadOnly => {}
        }
        let file = options.open(&config.path).map_err(|err| {
            error!("open({}) failed: {}", config.path.display(), err);
            if err.kind() == io::ErrorKind::NotFound {
                Error::NotFound(config.path.display().to_string())
            } else {
                Error::Io(err)
            }
        })?;

        if config.mode != MountMode::Format && config.medium == Medium::ImageFile {
            let len = file.metadata()?.len();
            let expected = config.geometry.image_len();
            if len < expected {
                error!(
                    "{}: image is {} bytes, expected {}",
                    config.path.display(),
                    len,
                    expected
                );
                return Err(Error::InvalidArgument(format!(
                    "{}: image is {len} bytes, expected at least {expected}",
                    config.path.display()
                )));
            }
        }
        Ok(file)
    }

    fn engine(&mut self, instance: u64, generation: u64) -> Result<&mut Engine> {
        if instance != self.instance {
            return Err(Error::InvalidArgument(
                "handle belongs to another image".into(),
            ));
        }
        match &mut self.mounted {
            Some(mounted) if mounted.generation == generation => Ok(&mut mounted.engine),
            Some(_) => Err(Error::InvalidArgument(
                "handle belongs to an earlier mount".into(),
            )),
            None => Err(Error::NotMounted),
        }
    }

    /// Whether a handle failing [`Self::engine`] was opened here by an engine
    /// that has since been unmounted, leaving its state unreferenced.
    fn orphaned(&self, instance: u64, generation: u64) -> bool {
        instance == self.instance
            && self
                .mounted
                .as_ref()
                .map_or(true, |mounted| mounted.generation != generation)
    }

    fn current(&mut self) -> Result<(&mut Engine, u64)> {
        let mounted = self.mounted.as_mut().ok_or(Error::NotMounted)?;
        Ok((&mut mounted.engine, mounted.generation))
    }
}

impl Vfs for LfsVfs {
    type File = LfsFile;
    type Dir = LfsDir;

    fn mount(&mut self) -> Result<()> {
        if self.mounted.is_some() {
            return Err(Error::InvalidArgument("image is already mounted".into()));
        }
        let geometry = self.config.geometry;
        geometry.validate(self.config.cipher.is_some())?;

        let file = self.open_image()?;
        let flash = ImageFlash::new(
            file,
            &geometry,
            self.config.cipher.clone(),
            self.config.base_offset,
            self.config.medium,
        );
        let mut engine = Engine::new(flash, &geometry);
        if self.config.mode == MountMode::Format {
            engine.fill_erased(geometry.block_count)?;
            engine.format()?;
        }
        engine.mount()?;

        info!(
            "mounted {} ({:?}, {} x {} bytes, {})",
            self.config.path.display(),
            self.config.mode,
            geometry.block_count,
            geometry.block_size,
            if self.config.cipher.is_some() {
                "encrypted"
            } else {
                "plain"
            }
        );
        self.mounted = Some(Mounted {
            engine,
            generation: MOUNT_IDS.fetch_add(1, Ordering::Relaxed),
        });
        Ok(())
    }

    fn unmount(&mut self) -> Result<()> {
        let mut mounted = self.mounted.take().ok_or(Error::NotMounted)?;
        let unmounted = mounted.engine.unmount();
        let synced = if self.config.mode.writable() {
            mounted.engine.sync()
        } else {
            Ok(())
        };
        debug!("unmounted {}", self.config.path.display());
        unmounted.and(synced)
    }

    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<LfsFile> {
        let c_path = c_path(path)?;
        let instance = self.instance;
        let (engine, generation) = self.current()?;
        let state = engine.file_open(&c_path, path, flags)?;
        Ok(LfsFile {
            state,
            instance,
            generation,
            path: path.to_owned(),
        })
    }

    fn close(&mut self, file: LfsFile) -> Result<()> {
        let orphaned = self.orphaned(file.instance, file.generation);
        match self.engine(file.instance, file.generation) {
            // SAFETY: instance and generation match, so the file is open on this engine
            Ok(engine) => unsafe { engine.file_close(file.state, &file.path) },
            Err(err) => {
                if orphaned {
                    // SAFETY: the engine that linked the state was dropped at unmount
                    drop(unsafe { Box::from_raw(file.state.as_ptr()) });
                }
                Err(err)
            }
        }
    }

    fn read(&mut self, file: &mut LfsFile, buf: &mut [u8]) -> Result<usize> {
        let engine = self.engine(file.instance, file.generation)?;
        unsafe { engine.file_read(file.state, buf, &file.path) }
    }

    fn write(&mut self, file: &mut LfsFile, buf: &[u8]) -> Result<usize> {
        let engine = self.engine(file.instance, file.generation)?;
        unsafe { engine.file_write(file.state, buf, &file.path) }
    }

    fn open_dir(&mut self, path: &str) -> Result<LfsDir> {
        let c_path = c_path(path)?;
        let instance = self.instance;
        let (engine, generation) = self.current()?;
        let state = engine.dir_open(&c_path, path)?;
        Ok(LfsDir {
            state,
            instance,
            generation,
            path: path.to_owned(),
        })
    }

    fn close_dir(&mut self, dir: LfsDir) -> Result<()> {
        let orphaned = self.orphaned(dir.instance, dir.generation);
        match self.engine(dir.instance, dir.generation) {
            // SAFETY: instance and generation match, so the directory is open on this engine
            Ok(engine) => unsafe { engine.dir_close(dir.state, &dir.path) },
            Err(err) => {
                if orphaned {
                    // SAFETY: as in `close`
                    drop(unsafe { Box::from_raw(dir.state.as_ptr()) });
                }
                Err(err)
            }
        }
    }

    fn read_dir(&mut self, dir: &mut LfsDir) -> Result<Option<DirEntry>> {
        let engine = self.engine(dir.instance, dir.generation)?;
        unsafe { engine.dir_read(dir.state, &dir.path) }
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        let c_path = c_path(path)?;
        let (engine, _) = self.current()?;
        engine.mkdir(&c_path, path)
    }
}

impl Drop for LfsVfs {
    fn drop(&mut self) {
        if self.mounted.is_some() {
            if let Err(err) = self.unmount() {
                warn!("unmount of {} failed: {}", self.config.path.display(), err);
            }
        }
    }
}
