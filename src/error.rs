//! Error types for the VidTRN training loop

use thiserror::Error;

/// Main error type for VidTRN operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal, reported at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed batch or metric input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Checkpoint does not fit the configured model
    #[error("Incompatible checkpoint: {0}")]
    IncompatibleCheckpoint(String),

    /// Checkpoint artifact is unreadable or missing required fields
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Safetensors encoding error
    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for VidTRN operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an incompatible checkpoint error
    pub fn incompatible_checkpoint(msg: impl Into<String>) -> Self {
        Self::IncompatibleCheckpoint(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
