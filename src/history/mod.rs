//! Run-over-run history.
//!
//! Each run stores a versioned snapshot of its ranked targets; the next run
//! loads it and explains how the ranking changed.

mod diff;
mod snapshot;

pub use diff::*;
pub use snapshot::*;

use thiserror::Error;

/// History error types.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("history file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed history snapshot {path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error("incompatible history snapshot version {found}")]
    Incompatible { found: u64 },
}
