//! Error types for tscast.

use thiserror::Error;

/// Result type alias using tscast's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tscast operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No TS sync pattern (three 0x47 bytes spaced 188 or 204 apart) was
    /// found anywhere in the file.
    #[error("TS sync not found in {0}")]
    SyncNotFound(String),

    /// Not enough PCRs in the file to infer a bitrate.
    #[error("unable to infer bitrate of {0}: not enough PCRs found")]
    BitrateIndeterminate(String),

    /// I/O error (file open/read, socket open/send).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stream id that is not in the supervisor's list.
    #[error("stream with id {0} not found")]
    StreamNotFound(u32),

    /// A component was used outside its lifecycle (started twice, stopped
    /// before start).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Broken internal invariant. The offending stream is terminated, the
    /// process keeps running.
    #[error("internal error: {0}")]
    Internal(String),
}
