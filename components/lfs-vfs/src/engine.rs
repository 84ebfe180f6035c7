//! Thin safe layer over the littlefs C engine.
//!
//! All engine state lives in one heap allocation that is never moved while
//! the engine exists: `lfs_t` keeps a pointer to its `lfs_config`, whose
//! context points at the [`Device`]. Open files and directories are linked
//! into the engine's open list, so their state is heap allocated as well and
//! only released by the matching close call.

use core::{
    ffi::{c_int, c_void, CStr},
    mem::MaybeUninit,
    ptr::{self, NonNull},
    slice,
};

use littlefs2_core::Error as LfsError;
use littlefs2_sys as ll;
use log::{debug, error};
use vfs::{DirEntry, EntryKind, Error, OpenFlags, Result};

use crate::{flash::ImageFlash, geometry::Geometry};

const LFS_O_RDONLY: c_int = 0x0001;
const LFS_O_WRONLY: c_int = 0x0002;
const LFS_O_RDWR: c_int = 0x0003;
const LFS_O_CREAT: c_int = 0x0100;
const LFS_O_TRUNC: c_int = 0x0400;
const LFS_O_APPEND: c_int = 0x0800;

const LFS_TYPE_REG: u8 = 0x001;
const LFS_TYPE_DIR: u8 = 0x002;

const LFS_ERR_IO: c_int = -5;
pub(crate) const LFS_ERR_EXIST: c_int = -17;

const FLAG_TABLE: [(OpenFlags, c_int); 6] = [
    (OpenFlags::READ_ONLY, LFS_O_RDONLY),
    (OpenFlags::WRITE_ONLY, LFS_O_WRONLY),
    (OpenFlags::READ_WRITE, LFS_O_RDWR),
    (OpenFlags::CREATE, LFS_O_CREAT),
    (OpenFlags::TRUNCATE, LFS_O_TRUNC),
    (OpenFlags::APPEND, LFS_O_APPEND),
];

/// Translates portable flags bit by bit; combinations are passed on as is.
pub(crate) fn lfs_flags(flags: OpenFlags) -> c_int {
    FLAG_TABLE
        .iter()
        .filter(|(portable, _)| flags.contains(*portable))
        .fold(0, |acc, (_, lfs)| acc | lfs)
}

/// Flash device as seen from the engine callbacks.
struct Device {
    flash: ImageFlash,
    /// Failure of the last callback, reported instead of the engine status.
    failure: Option<Error>,
}

impl Device {
    fn record(&mut self, result: Result<()>) -> c_int {
        match result {
            Ok(()) => 0,
            Err(err) => {
                error!("flash: {}", err);
                self.failure = Some(err);
                LFS_ERR_IO
            }
        }
    }
}

struct State {
    lfs: ll::lfs_t,
    config: ll::lfs_config,
    device: Device,
    read_buffer: Vec<u8>,
    prog_buffer: Vec<u8>,
    lookahead_buffer: Vec<u64>,
}

pub(crate) struct FileState {
    file: ll::lfs_file_t,
    config: ll::lfs_file_config,
    cache: Vec<u8>,
}

pub(crate) struct DirState {
    dir: ll::lfs_dir_t,
    info: ll::lfs_info,
    exhausted: bool,
}

/// Owner of one engine instance and the image behind it.
pub(crate) struct Engine {
    state: NonNull<State>,
    cache_size: usize,
}

unsafe fn device<'a>(c: *const ll::lfs_config) -> &'a mut Device {
    unsafe { &mut *(*c).context.cast::<Device>() }
}

unsafe extern "C" fn flash_read(
    c: *const ll::lfs_config,
    block: ll::lfs_block_t,
    off: ll::lfs_off_t,
    buffer: *mut c_void,
    size: ll::lfs_size_t,
) -> c_int {
    let device = unsafe { device(c) };
    let buf = unsafe { slice::from_raw_parts_mut(buffer.cast::<u8>(), size as usize) };
    let result = device.flash.read(block, off, buf);
    device.record(result)
}

unsafe extern "C" fn flash_prog(
    c: *const ll::lfs_config,
    block: ll::lfs_block_t,
    off: ll::lfs_off_t,
    buffer: *const c_void,
    size: ll::lfs_size_t,
) -> c_int {
    let device = unsafe { device(c) };
    let data = unsafe { slice::from_raw_parts(buffer.cast::<u8>(), size as usize) };
    let result = device.flash.prog(block, off, data);
    device.record(result)
}

unsafe extern "C" fn flash_erase(c: *const ll::lfs_config, block: ll::lfs_block_t) -> c_int {
    let device = unsafe { device(c) };
    let result = device.flash.erase(block);
    device.record(result)
}

unsafe extern "C" fn flash_sync(c: *const ll::lfs_config) -> c_int {
    let device = unsafe { device(c) };
    let result = device.flash.sync();
    device.record(result)
}

impl Engine {
    pub(crate) fn new(flash: ImageFlash, geometry: &Geometry) -> Self {
        let cache_size = geometry.cache_size as usize;
        let state: &mut State = Box::leak(Box::new(State {
            // SAFETY: plain C structs, all-zero is their unconfigured state
            lfs: unsafe { MaybeUninit::zeroed().assume_init() },
            config: unsafe { MaybeUninit::zeroed().assume_init() },
            device: Device {
                flash,
                failure: None,
            },
            read_buffer: vec![0; cache_size],
            prog_buffer: vec![0; cache_size],
            lookahead_buffer: vec![0; geometry.lookahead_size as usize / 8],
        }));

        let config = &mut state.config;
        config.context = ptr::addr_of_mut!(state.device).cast();
        config.read = Some(flash_read);
        config.prog = Some(flash_prog);
        config.erase = Some(flash_erase);
        config.sync = Some(flash_sync);
        config.read_size = geometry.io_size;
        config.prog_size = geometry.io_size;
        config.block_size = geometry.block_size;
        config.block_count = geometry.block_count;
        config.block_cycles = -1;
        config.cache_size = geometry.cache_size;
        config.lookahead_size = geometry.lookahead_size;
        config.read_buffer = state.read_buffer.as_mut_ptr().cast();
        config.prog_buffer = state.prog_buffer.as_mut_ptr().cast();
        config.lookahead_buffer = state.lookahead_buffer.as_mut_ptr().cast();
        config.name_max = geometry.name_max;

        Self {
            state: NonNull::from(state),
            cache_size,
        }
    }

    fn state(&mut self) -> &mut State {
        // SAFETY: allocated in `new`, released only in `drop`
        unsafe { self.state.as_mut() }
    }

    fn lfs(&mut self) -> *mut ll::lfs_t {
        ptr::addr_of_mut!(self.state().lfs)
    }

    /// Converts an engine status, preferring a failure recorded by the
    /// flash callbacks during the call.
    fn check(&mut self, code: c_int, op: &str, path: &str) -> Result<u32> {
        let failure = self.state().device.failure.take();
        if code >= 0 {
            return Ok(code as u32);
        }
        if let Some(failure) = failure {
            error!("{}({}) failed: {}", op, path, failure);
            return Err(failure);
        }
        let Some(lfs_error) = LfsError::new(code) else {
            return Err(Error::Engine { code });
        };
        error!("{}({}) failed: {:?}", op, path, lfs_error);
        Err(if lfs_error == LfsError::NO_SUCH_ENTRY {
            Error::NotFound(path.into())
        } else if lfs_error == LfsError::ENTRY_ALREADY_EXISTED {
            Error::AlreadyExists(path.into())
        } else if lfs_error == LfsError::NO_MEMORY {
            Error::Allocation(format!("{op}({path})"))
        } else {
            Error::Engine { code }
        })
    }

    pub(crate) fn fill_erased(&mut self, block_count: u32) -> Result<()> {
        debug!("erasing {} blocks", block_count);
        self.state().device.flash.fill_erased(block_count)
    }

    pub(crate) fn format(&mut self) -> Result<()> {
        debug!("formatting");
        let state = self.state();
        let code = unsafe { ll::lfs_format(&mut state.lfs, &state.config) };
        self.check(code, "format", "/").map(drop)
    }

    pub(crate) fn mount(&mut self) -> Result<()> {
        let state = self.state();
        let code = unsafe { ll::lfs_mount(&mut state.lfs, &state.config) };
        self.check(code, "mount", "/").map(drop)
    }

    pub(crate) fn unmount(&mut self) -> Result<()> {
        let code = unsafe { ll::lfs_unmount(self.lfs()) };
        self.check(code, "unmount", "/").map(drop)
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.state().device.flash.sync()
    }

    pub(crate) fn mkdir(&mut self, path: &CStr, display: &str) -> Result<()> {
        let code = unsafe { ll::lfs_mkdir(self.lfs(), path.as_ptr()) };
        if code == LFS_ERR_EXIST {
            debug!("mkdir({}): already exists", display);
            self.state().device.failure = None;
            return Ok(());
        }
        self.check(code, "mkdir", display).map(drop)
    }

    pub(crate) fn file_open(
        &mut self,
        path: &CStr,
        display: &str,
        flags: OpenFlags,
    ) -> Result<NonNull<FileState>> {
        let state: &mut FileState = Box::leak(Box::new(FileState {
            // SAFETY: plain C structs, all-zero is their closed state
            file: unsafe { MaybeUninit::zeroed().assume_init() },
            config: unsafe { MaybeUninit::zeroed().assume_init() },
            cache: vec![0; self.cache_size],
        }));
        state.config.buffer = state.cache.as_mut_ptr().cast();
        let state = NonNull::from(state);

        let code = unsafe {
            let raw = state.as_ptr();
            ll::lfs_file_opencfg(
                self.lfs(),
                ptr::addr_of_mut!((*raw).file),
                path.as_ptr(),
                lfs_flags(flags),
                ptr::addr_of!((*raw).config),
            )
        };
        match self.check(code, "open", display) {
            Ok(_) => Ok(state),
            Err(err) => {
                // SAFETY: the engine did not link a file it failed to open
                drop(unsafe { Box::from_raw(state.as_ptr()) });
                Err(err)
            }
        }
    }

    /// Closes and releases `file`.
    ///
    /// # Safety
    /// `file` must come from [`Engine::file_open`] on this engine and must
    /// not have been closed yet.
    pub(crate) unsafe fn file_close(&mut self, file: NonNull<FileState>, display: &str) -> Result<()> {
        let raw = file.as_ptr();
        let code = unsafe { ll::lfs_file_close(self.lfs(), ptr::addr_of_mut!((*raw).file)) };
        // the engine unlinks the file even when the final flush fails
        drop(unsafe { Box::from_raw(raw) });
        self.check(code, "close", display).map(drop)
    }

    /// # Safety
    /// `file` must be open on this engine.
    pub(crate) unsafe fn file_read(
        &mut self,
        file: NonNull<FileState>,
        buf: &mut [u8],
        display: &str,
    ) -> Result<usize> {
        let raw = file.as_ptr();
        let mut filled = 0;
        while filled < buf.len() {
            let want = (buf.len() - filled).min(i32::MAX as usize);
            let code = unsafe {
                ll::lfs_file_read(
                    self.lfs(),
                    ptr::addr_of_mut!((*raw).file),
                    buf[filled..].as_mut_ptr().cast(),
                    want as ll::lfs_size_t,
                )
            };
            let n = self.check(code, "read", display)? as usize;
            filled += n;
            if n < want {
                break;
            }
        }
        Ok(filled)
    }

    /// # Safety
    /// `file` must be open on this engine.
    pub(crate) unsafe fn file_write(
        &mut self,
        file: NonNull<FileState>,
        data: &[u8],
        display: &str,
    ) -> Result<usize> {
        let raw = file.as_ptr();
        let mut written = 0;
        while written < data.len() {
            let want = (data.len() - written).min(i32::MAX as usize);
            let code = unsafe {
                ll::lfs_file_write(
                    self.lfs(),
                    ptr::addr_of_mut!((*raw).file),
                    data[written..].as_ptr().cast(),
                    want as ll::lfs_size_t,
                )
            };
            match self.check(code, "write", display)? as usize {
                0 => {
                    error!("write({}) stalled at {} bytes", display, written);
                    return Err(Error::ShortTransfer {
                        requested: data.len(),
                        transferred: written,
                    });
                }
                n => written += n,
            }
        }
        Ok(written)
    }

    pub(crate) fn dir_open(&mut self, path: &CStr, display: &str) -> Result<NonNull<DirState>> {
        let state = NonNull::from(Box::leak(Box::new(DirState {
            // SAFETY: plain C structs, all-zero is their closed state
            dir: unsafe { MaybeUninit::zeroed().assume_init() },
            info: unsafe { MaybeUninit::zeroed().assume_init() },
            exhausted: false,
        })));
        let code = unsafe {
            ll::lfs_dir_open(
                self.lfs(),
                ptr::addr_of_mut!((*state.as_ptr()).dir),
                path.as_ptr(),
            )
        };
        match self.check(code, "opendir", display) {
            Ok(_) => Ok(state),
            Err(err) => {
                // SAFETY: the engine did not link a directory it failed to open
                drop(unsafe { Box::from_raw(state.as_ptr()) });
                Err(err)
            }
        }
    }

    /// # Safety
    /// `dir` must come from [`Engine::dir_open`] on this engine and must not
    /// have been closed yet.
    pub(crate) unsafe fn dir_close(&mut self, dir: NonNull<DirState>, display: &str) -> Result<()> {
        let raw = dir.as_ptr();
        let code = unsafe { ll::lfs_dir_close(self.lfs(), ptr::addr_of_mut!((*raw).dir)) };
        drop(unsafe { Box::from_raw(raw) });
        self.check(code, "closedir", display).map(drop)
    }

    /// Next entry of `dir`, including the `.` and `..` entries the engine
    /// reports first.
    ///
    /// # Safety
    /// `dir` must be open on this engine.
    pub(crate) unsafe fn dir_read(
        &mut self,
        dir: NonNull<DirState>,
        display: &str,
    ) -> Result<Option<DirEntry>> {
        let raw = dir.as_ptr();
        if unsafe { (*raw).exhausted } {
            return Ok(None);
        }
        let code = unsafe {
            ll::lfs_dir_read(
                self.lfs(),
                ptr::addr_of_mut!((*raw).dir),
                ptr::addr_of_mut!((*raw).info),
            )
        };
        if self.check(code, "readdir", display)? == 0 {
            unsafe { (*raw).exhausted = true };
            return Ok(None);
        }

        let info = unsafe { &(*raw).info };
        let name = unsafe { CStr::from_ptr(info.name.as_ptr()) }
            .to_str()
            .map_err(|_| Error::InvalidArgument(format!("{display}: entry name is not UTF-8")))?;
        let kind = match info.type_ {
            LFS_TYPE_REG => EntryKind::File,
            LFS_TYPE_DIR => EntryKind::Directory,
            other => {
                error!("readdir({}): {} has unknown type {}", display, name, other);
                return Err(Error::UnsupportedEntry(vfs::join(display, name)));
            }
        };
        DirEntry::new(name, kind).map(Some)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // SAFETY: allocated with `Box::leak` in `new` and not freed elsewhere
        drop(unsafe { Box::from_raw(self.state.as_ptr()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_table() {
        assert_eq!(lfs_flags(OpenFlags::READ_ONLY), LFS_O_RDONLY);
        assert_eq!(
            lfs_flags(OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE_ONLY),
            LFS_O_CREAT | LFS_O_TRUNC | LFS_O_WRONLY
        );
        assert_eq!(
            lfs_flags(OpenFlags::READ_WRITE | OpenFlags::APPEND),
            LFS_O_RDWR | LFS_O_APPEND
        );
        assert_eq!(lfs_flags(OpenFlags::empty()), 0);
    }

    #[test]
    fn engine_codes_name_littlefs_errors() {
        assert_eq!(LfsError::new(LFS_ERR_IO), Some(LfsError::IO));
        assert_eq!(LfsError::new(LFS_ERR_EXIST), Some(LfsError::ENTRY_ALREADY_EXISTED));
    }
}
