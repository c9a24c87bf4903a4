//! Sharded JSON file persistence.
//!
//! Documents are grouped into shards, one file each, named by a
//! per-collection persistence key. A resolver file records which shard
//! holds each document so a document whose key changes can be moved.
//! Shards of encrypted collections are stored with AES-256-GCM.

pub mod cipher;
pub mod config;
mod error;
pub mod local_disk;
pub mod persistor;
pub mod resolver;
pub mod shard;

pub use stash_core_store::{Path, PathError};

pub use cipher::{EncryptedCodec, EncryptionKey, PlainCodec, ShardCodec};
pub use config::{CollectionPersistence, PersistenceConfig, PersistenceKeyFn};
pub use error::{Error, Result};
pub use local_disk::ShardDirectory;
pub use persistor::{FlushReport, HydrationReport, PersistOp, Persistor};
pub use resolver::ShardResolver;
pub use shard::{DualShard, Shard, SyncOutcome};
