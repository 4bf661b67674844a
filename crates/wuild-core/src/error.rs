//! Error handling for Wuild.
//!
//! `WuildError` is the canonical error type crossing crate boundaries.
//! Transport keeps its own richer error enum and converts at the edge.

use thiserror::Error;

use crate::wire::WireError;

/// Result alias used across the workspace.
pub type WuildResult<T> = std::result::Result<T, WuildError>;

/// Canonical Wuild error.
#[derive(Error, Debug)]
pub enum WuildError {
    /// Bad or missing configuration; surfaced at startup, exits non-zero.
    #[error("configuration error: {0}")]
    Config(String),

    /// Frame/segment codec failure.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Connection-level failure reported by the transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// A command line could not be understood or split.
    #[error("invocation error: {0}")]
    Invocation(String),

    /// Running a local tool failed before it produced an exit status.
    #[error("execution error: {0}")]
    Execution(String),

    /// Compression or decompression of a payload failed.
    #[error("compression error: {0}")]
    Compression(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WuildError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn invocation(message: impl Into<String>) -> Self {
        Self::Invocation(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn compression(message: impl Into<String>) -> Self {
        Self::Compression(message.into())
    }
}
