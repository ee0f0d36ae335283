#![forbid(unsafe_code)]
//! Error types for MonoFS.
//!
//! Defines `FsError` and a `Result<T>` alias used throughout the workspace.
//! The CLI renders these as `Error: <message>`, so every message reads as a
//! plain sentence fragment.

use mfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all MonoFS operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file does not exist: {0}")]
    FileDoesNotExist(String),

    #[error("could not open file: {0}")]
    CouldNotOpenFile(String),

    #[error("file is not open")]
    FileNotOpen,

    #[error("image opened read-only")]
    FileReadOnly,

    #[error("read failed: {0}")]
    FileRead(String),

    #[error("write failed: {0}")]
    FileWrite(String),

    #[error("filesystem is not formatted")]
    NotFormatted,

    #[error("invalid filesystem size")]
    InvalidFilesystemSize,

    #[error("could not resize image: {0}")]
    CouldNotResizeImage(String),

    #[error("invalid superblock")]
    InvalidSuperblock,

    #[error("inode record has wrong size: expected {expected}, got {actual}")]
    InvalidInodeSize { expected: usize, actual: usize },

    #[error("block {block} read returned {actual} bytes, expected {expected}")]
    InvalidBlockSize {
        block: u32,
        expected: usize,
        actual: usize,
    },

    #[error("could not allocate inode")]
    CouldNotAllocateNode,

    #[error("could not allocate block")]
    CouldNotAllocateBlock,

    #[error("file too large: {0}")]
    FileTooLarge(&'static str),

    #[error("empty path")]
    EmptyPath,

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("no parent directory")]
    NoParentDirectory,

    #[error("child inode {0} not found in directory")]
    ChildNotFound(u32),

    #[error("block {0} is not attached to the inode")]
    BlockNotAttached(u32),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("directory not empty")]
    NotEmpty,

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Result alias using `FsError`.
pub type Result<T> = std::result::Result<T, FsError>;
