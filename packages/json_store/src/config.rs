//! Persistence settings: where shards live, how often they are flushed, and
//! per-collection persistence and encryption rules.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use stash_core_store::Path;

use crate::cipher::EncryptionKey;
use crate::{Error, Result};

/// Default delay between the first dirty-marking and the disk flush.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(100);

/// Maps a document to the name of the shard that stores it.
pub type PersistenceKeyFn = Rc<dyn Fn(&Path, &JsonValue) -> String>;

/// Persistence rules for one collection.
#[derive(Clone)]
pub struct CollectionPersistence {
    pub enabled: bool,
    pub encrypted: bool,
    pub persistence_key: Option<PersistenceKeyFn>,
}

impl CollectionPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// A collection that is kept in memory only.
    pub fn memory_only() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    pub fn with_persistence_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&Path, &JsonValue) -> String + 'static,
    {
        self.persistence_key = Some(Rc::new(key));
        self
    }
}

impl Default for CollectionPersistence {
    fn default() -> Self {
        Self {
            enabled: true,
            encrypted: false,
            persistence_key: None,
        }
    }
}

impl fmt::Debug for CollectionPersistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionPersistence")
            .field("enabled", &self.enabled)
            .field("encrypted", &self.encrypted)
            .field("persistence_key", &self.persistence_key.is_some())
            .finish()
    }
}

/// Where and how documents are persisted.
///
/// Collections without an entry in `collections` are persisted in plaintext
/// under a shard named after their root collection.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub directory: PathBuf,
    pub enabled: bool,
    pub throttle: Duration,
    pub encryption_key: Option<EncryptionKey>,
    pub collections: BTreeMap<String, CollectionPersistence>,
}

impl PersistenceConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            enabled: true,
            throttle: DEFAULT_THROTTLE,
            encryption_key: None,
            collections: BTreeMap::new(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Rules for a collection. `collection` is either a collection path
    /// (`users/1/notes`) or a root collection name (`users`).
    pub fn with_collection(
        mut self,
        collection: impl Into<String>,
        rules: CollectionPersistence,
    ) -> Self {
        self.collections.insert(collection.into(), rules);
        self
    }

    /// Reject rules that could never be satisfied.
    pub fn validate(&self) -> Result<()> {
        if self.encryption_key.is_some() {
            return Ok(());
        }
        match self.collections.iter().find(|(_, rules)| rules.encrypted) {
            Some((collection, _)) => Err(Error::MissingKey {
                collection: collection.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Rules for the collection owning `path`: an entry for the exact
    /// parent collection wins over one for the root collection.
    pub fn collection(&self, path: &Path) -> Option<&CollectionPersistence> {
        let own = path.parent().filter(|parent| parent.is_collection());
        own.and_then(|parent| self.collections.get(&parent.to_string()))
            .or_else(|| {
                path.root_collection()
                    .and_then(|root| self.collections.get(root))
            })
    }

    pub fn is_persisted(&self, path: &Path) -> bool {
        self.enabled && self.collection(path).map_or(true, |rules| rules.enabled)
    }

    pub fn is_encrypted(&self, path: &Path) -> bool {
        self.collection(path).is_some_and(|rules| rules.encrypted)
    }

    /// Name of the shard that should store the document at `path`.
    pub fn shard_for(&self, path: &Path, value: &JsonValue) -> String {
        if let Some(key) = self
            .collection(path)
            .and_then(|rules| rules.persistence_key.as_ref())
        {
            return key(path, value);
        }
        path.root_collection().unwrap_or_default().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stash_core_store::path;

    #[test]
    fn defaults_to_root_collection_shard() {
        let config = PersistenceConfig::new("/tmp/stash");
        assert!(config.enabled);
        assert_eq!(config.throttle, DEFAULT_THROTTLE);
        assert!(config.is_persisted(&path!("posts/1")));
        assert!(!config.is_encrypted(&path!("posts/1")));
        assert_eq!(config.shard_for(&path!("posts/1"), &json!({})), "posts");
        assert_eq!(
            config.shard_for(&path!("posts/1/comments/2"), &json!({})),
            "posts"
        );
    }

    #[test]
    fn persistence_key_picks_shard() {
        let config = PersistenceConfig::new("/tmp/stash").with_collection(
            "posts",
            CollectionPersistence::new().with_persistence_key(|_, value| {
                format!("posts-{}", value["year"].as_i64().unwrap_or(0))
            }),
        );
        assert_eq!(
            config.shard_for(&path!("posts/1"), &json!({"year": 2024})),
            "posts-2024"
        );
        assert_eq!(config.shard_for(&path!("posts/1"), &json!({})), "posts-0");
    }

    #[test]
    fn nested_collection_rules_win() {
        let config = PersistenceConfig::new("/tmp/stash")
            .with_collection("users", CollectionPersistence::new())
            .with_collection(
                "users/1/secrets",
                CollectionPersistence::new().encrypted(),
            )
            .with_collection("cache", CollectionPersistence::memory_only());

        assert!(config.is_encrypted(&path!("users/1/secrets/a")));
        assert!(!config.is_encrypted(&path!("users/1")));
        assert!(!config.is_encrypted(&path!("users/2/secrets/a")));
        assert!(!config.is_persisted(&path!("cache/x")));
        assert!(!config.clone().disabled().is_persisted(&path!("users/1")));
    }

    #[test]
    fn encrypted_collection_needs_key() {
        let config = PersistenceConfig::new("/tmp/stash")
            .with_collection("secrets", CollectionPersistence::new().encrypted());
        assert!(matches!(
            config.validate(),
            Err(Error::MissingKey { collection }) if collection == "secrets"
        ));
        assert!(config
            .with_encryption_key(EncryptionKey::generate())
            .validate()
            .is_ok());
    }
}
