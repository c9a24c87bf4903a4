//! Error types for shard persistence.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while hydrating, persisting or rebalancing shards.
#[derive(Debug, Error)]
pub enum Error {
    /// Error from the core indexes.
    #[error("core error: {0}")]
    Core(#[from] stash_core_store::Error),

    /// The persistence directory could not be used.
    #[error("root path '{}' is invalid: {source}", path.display())]
    RootPathInvalid { path: PathBuf, source: io::Error },

    /// A file operation failed.
    #[error("io error on '{}': {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    /// A shard file exists but could not be read, decrypted or parsed.
    #[error("shard '{shard}' is corrupt: {message}")]
    CorruptShard { shard: String, message: String },

    /// The resolver file exists but could not be read or parsed.
    #[error("resolver is corrupt: {message}")]
    CorruptResolver { message: String },

    /// Serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encryption or decryption failed.
    #[error("encryption error: {message}")]
    Encryption { message: String },

    /// A collection asked for encryption but no key was configured.
    #[error("collection '{collection}' is encrypted but no encryption key is configured")]
    MissingKey { collection: String },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn encryption(message: impl Into<String>) -> Self {
        Error::Encryption {
            message: message.into(),
        }
    }

    /// True for errors that mean stored data cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::CorruptShard { .. } | Error::CorruptResolver { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
