use stash_core_store::{Path, PathError};
use thiserror::Error;

/// Errors returned by [`Store`](crate::Store) operations.
///
/// A write or delete that returns an error has not mutated anything.
#[derive(Debug, Error)]
pub enum Error {
    #[error("core error: {0}")]
    Core(#[from] stash_core_store::Error),

    #[error("invalid path: {0}")]
    Path(#[from] PathError),

    #[error("persistence error: {0}")]
    Persistence(#[from] stash_json_store::Error),

    /// The path has the wrong shape for the operation.
    #[error("'{path}' is not a {expected} path")]
    InvalidPath { path: Path, expected: &'static str },

    /// A typed value does not survive a JSON round trip unchanged.
    #[error("value for '{path}' does not round-trip through JSON: {message}")]
    SerializationMismatch { path: Path, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use stash_core_store::path;

    #[test]
    fn invalid_path_display() {
        let e = Error::InvalidPath {
            path: path!("posts"),
            expected: "document",
        };
        assert_eq!(e.to_string(), "'posts' is not a document path");
    }

    #[test]
    fn persistence_error_converts() {
        let e: Error = stash_json_store::Error::MissingKey {
            collection: "vault".to_string(),
        }
        .into();
        assert!(matches!(e, Error::Persistence(_)));
        assert!(e.to_string().contains("vault"));
    }
}
