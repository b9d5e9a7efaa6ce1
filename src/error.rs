//! Error kinds for the index store, matching the kinds the core must
//! distinguish: corrupted on-disk structures, unsupported model versions,
//! I/O failures, bad caller arguments, incomplete repositories, and
//! impossible internal states.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("corrupted index at {path}: {reason}")]
    CorruptedIndex { path: PathBuf, reason: String },

    #[error("unrecognized model-kind {found:?} in {path}")]
    VersionMismatch { path: PathBuf, found: String },

    #[error("I/O failure on {path}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("repository at {path} is missing its `done` sentinel (incomplete build)")]
    IncompleteIndex { path: PathBuf },

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoFailure {
            path: path.into(),
            source,
        }
    }

    pub fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptedIndex {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Reports and aborts the process. `InternalInvariant` conditions are
    /// not meant to be handled by callers; spec requires we abort with a
    /// diagnostic rather than propagate a recoverable error.
    pub fn abort(msg: impl Into<String>) -> ! {
        let msg = msg.into();
        log::error!("internal invariant violated: {msg}");
        panic!("internal invariant violated: {msg}");
    }
}

pub type Result<T> = std::result::Result<T, Error>;
