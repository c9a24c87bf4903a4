//! Error types for the core indexes.

use thiserror::Error;

use crate::path::{Path, PathError};

/// Errors raised by the core indexes.
#[derive(Debug, Error)]
pub enum Error {
    /// Path validation error.
    #[error("path error: {0}")]
    Path(#[from] PathError),

    /// `dec` was called on a path whose count is already zero.
    ///
    /// This is a contract violation by the caller; the store is left untouched.
    #[error("reference count underflow at '{path}'")]
    RefCountUnderflow { path: Path },

    /// A snapshot could not be turned back into a store.
    #[error("invalid snapshot: {message}")]
    Snapshot { message: String },
}

impl Error {
    pub fn snapshot(message: impl Into<String>) -> Self {
        Error::Snapshot {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use std::error::Error as StdError;

    #[test]
    fn underflow_display() {
        let e = Error::RefCountUnderflow {
            path: path!("posts/1"),
        };
        assert!(e.to_string().contains("posts/1"));
        assert!(e.to_string().contains("underflow"));
    }

    #[test]
    fn path_error_source() {
        let e = Error::from(PathError::InvalidPath {
            message: "bad".to_string(),
        });
        assert!(e.to_string().contains("path error"));
        assert!(e.source().is_some());
    }

    #[test]
    fn snapshot_display() {
        let e = Error::snapshot("expected object");
        assert_eq!(e.to_string(), "invalid snapshot: expected object");
    }
}
