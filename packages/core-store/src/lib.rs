//! Core Stash: in-memory indexes
//!
//! This layer holds the data structures every other Stash crate is built on:
//! - `Path`: slash-delimited document/collection path
//! - `PathTrie`: hierarchical path → value index (the document index)
//! - `RefCountedPathStore`: path trie of reference counts and assigned values
//!   (dependency tracking, shard assignment)
//!
//! Nothing here does I/O or scheduling.
//!
//! # Example
//!
//! ```rust
//! use stash_core_store::{PathTrie, path};
//! use serde_json::json;
//!
//! let mut documents = PathTrie::new();
//! documents.insert(&path!("users/alice"), json!({"name": "Alice"}));
//! assert!(documents.contains(&path!("users/alice")));
//! ```

mod error;
mod path;
pub mod path_trie;
pub mod ref_store;

pub use error::Error;
pub use path::{Path, PathError, DELIMITER};
pub use path_trie::PathTrie;
pub use ref_store::{NodeState, RefCountedPathStore};
