//! Errors raised while writing an image
//!
//! Every variant is fatal to the dump. The destination file is left
//! with its completion marker unset.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("cannot dump {kind}: {description}")]
    Unsupported { kind: String, description: String },
    #[error("dumping {0} is not yet implemented")]
    NotImplemented(String),
    #[error("{kind} of {size} bytes exceeds the maximum object size of {limit}")]
    ObjectTooLarge {
        kind: String,
        size: usize,
        limit: usize,
    },
    #[error("{kind} payload of {len} bytes is too large to dump")]
    PayloadTooLarge { kind: String, len: usize },
    #[error("image of {0} bytes exceeds the addressable limit")]
    ImageTooLarge(u64),
    #[error("reference to missing {0}")]
    DanglingReference(String),
    #[error("fixnum {0} does not fit in a tagged word")]
    FixnumOverflow(i64),
    #[error("remembered location {0} lies outside host storage")]
    BadRemembered(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
