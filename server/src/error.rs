//! Error types for the dungeon server.

use shared::protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`ServerError`].
pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A level file exists but could not be read.
    #[error("failed to load level {level} from '{path}': {source}")]
    Level {
        level: u32,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("server is not running")]
    NotRunning,

    #[error("server is already running")]
    AlreadyRunning,
}
