//! Error types for MirrorIO
//!
//! Configuration and validation errors shared by the engine and the CLI.
//! Runtime I/O errors live with the engine in `mirrorio-raid1`.

use thiserror::Error;

/// Common result type for MirrorIO configuration operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for MirrorIO
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if the error was caused by user input rather than the environment
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::InvalidArgument(_) | Self::Deserialization(_)
        )
    }
}
