use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}: no such file or directory")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("short transfer: {transferred} of {requested} bytes")]
    ShortTransfer { requested: usize, transferred: usize },
    #[error("out of memory: {0}")]
    Allocation(String),
    #[error("{0}: already exists")]
    AlreadyExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("filesystem is not mounted")]
    NotMounted,
    #[error("{0}: neither a regular file nor a directory")]
    UnsupportedEntry(String),
    #[error("cipher error: {0}")]
    Crypto(String),
    #[error("flash filesystem engine error {code}")]
    Engine { code: i32 },
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
