//! Overall high-level error type for the command line driver
use std::io;

use thiserror::Error;

use crate::dump::error::DumpError;
use crate::heap::graph::Mismatch;
use crate::heap::HeapError;
use crate::load::error::{LoadError, RegistryError};

#[derive(Debug, Error)]
pub enum HeapImageError {
    #[error(transparent)]
    Dump(#[from] DumpError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error("verification failed: {0}")]
    Verify(#[from] Mismatch),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HeapImageError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            HeapImageError::Load(_) => 3,
            HeapImageError::Verify(_) => 4,
            _ => 2,
        }
    }
}
