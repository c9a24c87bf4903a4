//! Stash: a reactive, path-addressed document store.
//!
//! Documents live at paths that alternate collection and document segments
//! (`users/alice`, `users/alice/notes/1`). The [`Store`] keeps them in
//! memory, batches change notifications per document, tracks dependencies
//! between documents, and persists configured collections to sharded
//! (optionally encrypted) JSON files.
//!
//! # Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use stash::{path, EventKind, PersistenceConfig, Store, StoreConfig};
//!
//! # async fn run() -> Result<(), stash::Error> {
//! let local = tokio::task::LocalSet::new();
//! local
//!     .run_until(async {
//!         let config = StoreConfig::new().with_persistence(PersistenceConfig::new("./data"));
//!         let store = Store::open(config).await?;
//!
//!         let _subscription = store.subscribe(&path!("users"), |event, value| {
//!             println!("{} {}: {:?}", event.kind, event.path, value);
//!         });
//!         store.write(&path!("users/alice"), json!({"name": "Alice"}), EventKind::Added)?;
//!         store.flush().await;
//!         Ok::<(), stash::Error>(())
//!     })
//!     .await
//! # }
//! ```

pub mod broadcast;
pub mod config;
mod error;
pub mod store;
mod typed;

pub use stash_core_store::{path, Path, PathError, PathTrie, RefCountedPathStore};
pub use stash_json_store::{
    CollectionPersistence, EncryptionKey, FlushReport, HydrationReport, PersistenceConfig,
};

pub use broadcast::{BroadcastManager, ChangeEvent, EventKind, Observer, ObserverId};
pub use config::{DeliveryMode, DependenciesBuilder, StoreConfig};
pub use error::{Error, Result};
pub use store::{Store, Subscription};
