use std::io;
use std::path::PathBuf;

use annex_core::CodecError;
use thiserror::Error;

use crate::engine::EngineError;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("key {0} is already active")]
    DuplicateKey(u64),

    #[error("key {0} is not active")]
    UnknownKey(u64),

    #[error("no mapping row for positional index {index}")]
    MappingNotFound { index: u64 },

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("apply failed at seq {seq} (key {key}): {source}")]
    ApplyFailed {
        seq: u64,
        key: u64,
        #[source]
        source: Box<StoreError>,
    },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("corrupt store state: {0}")]
    Corrupt(String),

    #[error("a store already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error("cannot truncate binlog up to seq {requested}: cursor is at {cursor}")]
    InvalidTruncate { requested: u64, cursor: u64 },
}

impl StoreError {
    /// Caller mistakes: surfaced as-is and never worth retrying.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StoreError::DimensionMismatch { .. }
                | StoreError::DuplicateKey(_)
                | StoreError::UnknownKey(_)
                | StoreError::MappingNotFound { .. }
                | StoreError::Parse { .. }
                | StoreError::Codec(_)
        )
    }
}
