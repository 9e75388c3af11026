//! Error types for the node power core library.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while integrating samples or persisting counters.
#[derive(Error, Debug)]
pub enum Error {
    /// A sample went back in time while negative intervals are rejected.
    #[error("non-monotonic timestamp for host {host}: {current} after {previous}")]
    NonMonotonicTimestamp {
        host: String,
        previous: i64,
        current: i64,
    },

    /// Counter state file exists but could not be decoded.
    #[error("corrupt counter state in {path}: {source}")]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Counter state could not be encoded.
    #[error("failed to encode counter state: {0}")]
    Encode(#[from] serde_json::Error),

    /// Counter state file I/O error.
    #[error("counter state I/O error on {path}: {source}")]
    StateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
