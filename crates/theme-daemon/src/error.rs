//! Error taxonomy of the focus-to-playback pipeline.
//!
//! None of these are fatal: the core logs them and degrades to silence.

use std::time::Duration;

use theme_proto::store::StoreError;

pub type Result<T> = std::result::Result<T, ThemeError>;

#[derive(Debug, thiserror::Error)]
pub enum ThemeError {
    /// Persistent identifier lookup failed or returned malformed data.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The backend answered with an error.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend call timed out after {0:?}")]
    BackendTimeout(Duration),

    /// The output device rejected a source or command.
    #[error("playback error: {0}")]
    Playback(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A peer sent something we could not make sense of.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ThemeError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn playback(message: impl Into<String>) -> Self {
        Self::Playback(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}
