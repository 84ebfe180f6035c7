use std::{path::PathBuf, process::ExitCode};

use clap::{ArgGroup, Parser, ValueEnum};
use clap_num::maybe_hex;
use lfs_vfs::{
    BlockCipher, Geometry, ImageConfig, LfsVfs, Medium, MountMode, DEFAULT_BLOCK_COUNT,
    DEFAULT_BLOCK_SIZE, DEFAULT_IO_SIZE,
};
use log::{error, info, warn};
use memory_regions::MemoryRegions;
use native_vfs::NativeVfs;
use tree_mirror::{Stats, TreeMirror};
use vfs::Vfs as _;

const DEFAULT_BASE_OFFSET: u64 = MemoryRegions::EXTERNAL_FLASH.base_offset() as u64;

/// Converts between a directory tree and a littlefs image of the external
/// flash, optionally encrypted.
#[derive(Parser, Debug)]
#[command(about, author, version)]
#[command(group(ArgGroup::new("direction").required(true).args(["extract", "create"])))]
struct Args {
    /// Maximum entry name length (0: littlefs default).
    #[arg(short = 'n', long, default_value_t = 0)]
    name_max: u32,

    /// Read, program, cache and lookahead size in bytes (0: default).
    #[arg(short = 's', long, default_value_t = DEFAULT_IO_SIZE)]
    io_size: u32,

    /// Erase block size in bytes (0: default).
    #[arg(short = 'b', long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u32,

    /// Number of blocks in the image (0: default).
    #[arg(short = 'a', long, default_value_t = DEFAULT_BLOCK_COUNT)]
    block_count: u32,

    /// Key file enabling encryption: a 16-byte key or a 128-byte key table.
    #[arg(short = 'k', long)]
    key: Option<PathBuf>,

    /// Flash offset of the image, used for the encryption IVs.
    #[arg(long, value_parser = maybe_hex::<u64>, default_value_t = DEFAULT_BASE_OFFSET)]
    base_offset: u64,

    /// What the image file is.
    ///
    /// On raw flash the erase step is left to the hardware.
    #[arg(long, value_enum, default_value_t)]
    medium: MediumArg,

    /// littlefs image file.
    #[arg(short = 'i', long)]
    image: PathBuf,

    /// Directory tree to extract to or create from.
    #[arg(short = 'd', long)]
    directory: PathBuf,

    /// Extract the image into the directory.
    #[arg(short = 'x', long)]
    extract: bool,

    /// Create the image from the directory.
    #[arg(short = 'c', long)]
    create: bool,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum MediumArg {
    #[default]
    File,
    Flash,
}

impl From<MediumArg> for Medium {
    fn from(medium: MediumArg) -> Self {
        match medium {
            MediumArg::File => Medium::ImageFile,
            MediumArg::Flash => Medium::RawFlash,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum Failure {
    #[error("invalid configuration: {0}")]
    Config(vfs::Error),
    #[error("mount failed: {0}")]
    Mount(vfs::Error),
    #[error("traversal failed: {0}")]
    Traversal(vfs::Error),
}

impl Failure {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Mount(_) => 2,
            Self::Traversal(_) => 3,
        }
    }
}

fn main() -> ExitCode {
    pretty_env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // help and version end up here as well
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(&args) {
        Ok(stats) => {
            info!(
                "{} {} directories, {} files, {} bytes",
                if args.create { "created" } else { "extracted" },
                stats.directories,
                stats.files,
                stats.bytes
            );
            ExitCode::SUCCESS
        }
        Err(failure) => {
            error!("{}", failure);
            ExitCode::from(failure.exit_code())
        }
    }
}

/// `0` on the command line keeps the default.
fn or_default(value: u32, default: u32) -> u32 {
    if value == 0 {
        default
    } else {
        value
    }
}

fn image_config(args: &Args) -> Result<ImageConfig, vfs::Error> {
    let cipher = args
        .key
        .as_deref()
        .map(BlockCipher::from_key_file)
        .transpose()?;
    let geometry = Geometry {
        block_size: or_default(args.block_size, DEFAULT_BLOCK_SIZE),
        block_count: or_default(args.block_count, DEFAULT_BLOCK_COUNT),
        name_max: args.name_max,
        ..Geometry::default().with_io_size(or_default(args.io_size, DEFAULT_IO_SIZE))
    };
    geometry.validate(cipher.is_some())?;

    let mode = if args.create {
        MountMode::Format
    } else {
        MountMode::ReadOnly
    };
    Ok(ImageConfig::new(&args.image, mode)
        .geometry(geometry)
        .cipher(cipher)
        .base_offset(args.base_offset)
        .medium(args.medium.into()))
}

fn run(args: &Args) -> Result<Stats, Failure> {
    let config = image_config(args).map_err(Failure::Config)?;
    let mut native = NativeVfs::new(&args.directory);
    native.mount().map_err(Failure::Mount)?;
    // create mode formats the image on mount, the tree has to be there first
    if args.create && !args.directory.is_dir() {
        let _ = native.unmount();
        return Err(Failure::Mount(vfs::Error::NotFound(
            args.directory.display().to_string(),
        )));
    }
    let mut image = LfsVfs::new(config);
    if let Err(err) = image.mount() {
        let _ = native.unmount();
        return Err(Failure::Mount(err));
    }

    let mirrored = if args.create {
        TreeMirror::new(&mut native, &mut image).run("/")
    } else {
        TreeMirror::new(&mut image, &mut native).run("/")
    };
    let unmounted = image.unmount().and(native.unmount());

    match (mirrored, unmounted) {
        (Ok(stats), Ok(())) => Ok(stats),
        (Ok(_), Err(err)) => Err(Failure::Mount(err)),
        (Err(err), unmounted) => {
            if let Err(unmount_err) = unmounted {
                warn!("unmount failed: {}", unmount_err);
            }
            Err(Failure::Traversal(err))
        }
    }
}
