use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde_json::Value as JsonValue;
use stash_core_store::Path;
use stash_json_store::PersistenceConfig;

/// Computes the documents a document depends on from its data.
pub type DependenciesBuilder = Rc<dyn Fn(&JsonValue) -> Vec<Path>>;

/// When pending change events reach observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// A delivery pass is spawned on the local task set after the first
    /// change of a batch.
    #[default]
    Deferred,
    /// Events wait for an explicit `Store::deliver_pending`.
    Manual,
}

/// Configuration for a [`Store`](crate::Store).
#[derive(Clone, Default)]
pub struct StoreConfig {
    /// `None` keeps every document in memory only.
    pub persistence: Option<PersistenceConfig>,
    /// Dependency builders keyed by root collection name.
    pub dependencies: BTreeMap<String, DependenciesBuilder>,
    pub delivery: DeliveryMode,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_dependencies<F>(mut self, collection: impl Into<String>, builder: F) -> Self
    where
        F: Fn(&JsonValue) -> Vec<Path> + 'static,
    {
        self.dependencies.insert(collection.into(), Rc::new(builder));
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub(crate) fn dependencies_for(&self, path: &Path) -> Option<&DependenciesBuilder> {
        self.dependencies.get(path.root_collection()?)
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("persistence", &self.persistence)
            .field(
                "dependencies",
                &self.dependencies.keys().collect::<Vec<_>>(),
            )
            .field("delivery", &self.delivery)
            .finish()
    }
}
