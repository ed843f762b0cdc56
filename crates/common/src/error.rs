//! Common error types for BatchLoop
//!
//! This module defines the error type returned by every fallible BatchLoop
//! operation. Per-prompt problems never surface here: they are recorded as
//! error-marked completions, and only run-level failures become an `Err`.

use thiserror::Error;

/// Main error type for BatchLoop
#[derive(Error, Debug)]
pub enum BatchLoopError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Tokenizer rejected the text
    #[error("Tokenization error: {0}")]
    Tokenization(String),

    /// Sampler construction or sampling failure
    #[error("Sampling error: {0}")]
    Sampling(String),

    /// Unrecoverable decoder failure
    #[error("Fatal decode error in {stage}: {code}")]
    Decode {
        /// Phase of the run that issued the decode call
        stage: &'static str,
        /// Engine-reported return code
        code: i32,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BatchLoopError {
    /// Whether the error aborts a whole generation run
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BatchLoopError::Tokenization(_) | BatchLoopError::Sampling(_)
        )
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        BatchLoopError::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        BatchLoopError::InvalidInput(msg.into())
    }

    /// Create a tokenization error
    pub fn tokenization(msg: impl Into<String>) -> Self {
        BatchLoopError::Tokenization(msg.into())
    }

    /// Create a sampling error
    pub fn sampling(msg: impl Into<String>) -> Self {
        BatchLoopError::Sampling(msg.into())
    }

    /// Create a fatal decode error
    pub fn decode(stage: &'static str, code: i32) -> Self {
        BatchLoopError::Decode { stage, code }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        BatchLoopError::Internal(msg.into())
    }
}

/// Result type alias for BatchLoop operations
pub type Result<T> = std::result::Result<T, BatchLoopError>;
