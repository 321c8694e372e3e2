//! Load-time errors and the status taxonomy reported to callers

use std::fmt;
use std::io;

use thiserror::Error;

use crate::heap::host::Remembered;
use crate::image::fingerprint::Fingerprint;

/// Outcome of a load attempt
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    Success,
    FileNotFound,
    BadFileType,
    VersionMismatch,
    PreviousWriteIncomplete,
    OutOfMemory,
    /// OS error code, zero when there is none
    GenericIOError(i32),
    /// An image is already loaded into this process or runtime
    AlreadyLoaded,
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStatus::Success => f.write_str("success"),
            LoadStatus::FileNotFound => f.write_str("file not found"),
            LoadStatus::BadFileType => f.write_str("not a heap image"),
            LoadStatus::VersionMismatch => f.write_str("image built by a different binary"),
            LoadStatus::PreviousWriteIncomplete => f.write_str("image write was interrupted"),
            LoadStatus::OutOfMemory => f.write_str("out of memory"),
            LoadStatus::GenericIOError(code) => write!(f, "I/O error ({code})"),
            LoadStatus::AlreadyLoaded => f.write_str("an image is already loaded"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("section {index} size {size:#x} is not a multiple of the page size")]
    BadSize { index: usize, size: usize },
    #[error("nothing to map")]
    Empty,
    #[error("out of memory mapping {0:#x} bytes")]
    OutOfMemory(usize),
    #[error("address space kept moving after {0} attempts")]
    Exhausted(usize),
    #[error(transparent)]
    Os(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("image file not found")]
    FileNotFound,
    #[error("not a heap image")]
    BadFileType,
    #[error("image fingerprint mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        expected: Fingerprint,
        found: Fingerprint,
    },
    #[error("image was not completely written")]
    PreviousWriteIncomplete,
    #[error("out of memory loading image")]
    OutOfMemory,
    #[error("corrupt image: {0}")]
    Corrupt(String),
    #[error("native code: {0}")]
    NativeCode(String),
    #[error("an image is already loaded")]
    AlreadyLoaded,
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LoadError {
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        LoadError::Corrupt(msg.into())
    }

    /// Status reported for this error
    pub fn status(&self) -> LoadStatus {
        match self {
            LoadError::FileNotFound => LoadStatus::FileNotFound,
            LoadError::BadFileType | LoadError::Corrupt(_) => LoadStatus::BadFileType,
            LoadError::VersionMismatch { .. } => LoadStatus::VersionMismatch,
            LoadError::PreviousWriteIncomplete => LoadStatus::PreviousWriteIncomplete,
            LoadError::OutOfMemory | LoadError::Map(MapError::OutOfMemory(_)) => {
                LoadStatus::OutOfMemory
            }
            LoadError::NativeCode(_) => LoadStatus::GenericIOError(0),
            LoadError::AlreadyLoaded => LoadStatus::AlreadyLoaded,
            LoadError::Map(MapError::Os(e)) | LoadError::Io(e) => {
                LoadStatus::GenericIOError(e.raw_os_error().unwrap_or(0))
            }
            LoadError::Map(_) => LoadStatus::GenericIOError(0),
        }
    }
}

/// A registration the runtime refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("too many load hooks (limit {0})")]
    Hooks(usize),
    #[error("too many remembered locations (limit {0})")]
    Remembered(usize),
    #[error("remembered location {0:?} lies outside host storage")]
    OutOfRange(Remembered),
}
