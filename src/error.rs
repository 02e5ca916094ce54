//! Custom error types for the lextree decoder.
//!
//! This module provides a centralized error handling system using the `thiserror` crate
//! to define structured, typed errors with clear messages and proper error conversion.

use std::io;
use thiserror::Error;

use crate::types::TimeframeIndex;

/// Primary error type for the decoder, covering all possible error cases.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// Malformed or inconsistent configuration parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A required model was not bound before use.
    #[error("Missing model binding: {0}")]
    MissingBinding(&'static str),

    /// An operation was invoked in the wrong lifecycle state.
    #[error("Invalid decoder state: {0}")]
    InvalidState(String),

    /// Every hypothesis was pruned and no fallback was possible.
    #[error("Search space became empty at frame {frame}")]
    EmptySearchSpace { frame: TimeframeIndex },

    /// No sentence end could be hypothesized.
    #[error("No sentence end hypothesis at frame {frame}")]
    NoSentenceEnd { frame: TimeframeIndex },

    /// The persisted state tree could not be used.
    #[error("State tree file error: {0}")]
    TreeFile(#[from] TreeFileError),

    /// Invalid lexicon construction input.
    #[error("Lexicon error: {0}")]
    Lexicon(String),

    /// An internal consistency check failed.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Errors from the underlying IO system.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Reasons a persisted state tree is rejected.
#[derive(Debug, Error)]
pub enum TreeFileError {
    #[error("bad magic header")]
    BadMagic,

    #[error("unsupported format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("dependency mismatch: {0}")]
    DependencyMismatch(String),

    #[error("truncated file: needed {needed} more bytes while reading {section}")]
    Truncated {
        section: &'static str,
        needed: usize,
    },

    #[error("corrupt payload: {0}")]
    Corrupt(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Convenience type alias for Results with DecoderError.
pub type Result<T> = std::result::Result<T, DecoderError>;

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to the error.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Add static context to the error.
    fn with_static_context(self, context: &'static str) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| DecoderError::Internal(format!("{}: {}", f(), e)))
    }

    fn with_static_context(self, context: &'static str) -> Result<T> {
        self.map_err(|e| DecoderError::Internal(format!("{}: {}", context, e)))
    }
}

impl DecoderError {
    /// Whether the session can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DecoderError::TreeFile(_) | DecoderError::NoSentenceEnd { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_file_error_converts() {
        let err: DecoderError = TreeFileError::BadMagic.into();
        assert!(matches!(err, DecoderError::TreeFile(TreeFileError::BadMagic)));
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
        let err = result.with_static_context("opening tree").unwrap_err();
        assert_eq!(err.to_string(), "Internal error: opening tree: gone");
        assert!(!err.is_recoverable());
    }
}
