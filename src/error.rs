use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    #[error("corrupt filesystem: {0}")]
    CorruptFilesystem(String),

    #[error("corrupt block chain: {0}")]
    CorruptChain(String),

    #[error("out of space: {needed} blocks needed, {free} free")]
    OutOfSpace { needed: u64, free: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("name already exists: {0}")]
    DuplicateName(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("entry is protected: {0}")]
    Protected(String),

    #[error("integrity check failed: stored {stored}, computed {computed}")]
    Integrity { stored: String, computed: String },

    #[error("host file not found: {0}")]
    HostFileNotFound(String),

    #[error("host I/O error: {0}")]
    HostIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;
