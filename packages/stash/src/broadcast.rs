//! Change events and the observers waiting for them.
//!
//! Events are queued per document path and merged as they arrive, so a
//! burst of changes to one document reaches observers as a single event.
//! The manager only queues and looks up; the store decides when a delivery
//! pass runs.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use stash_core_store::{Path, PathTrie};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Added,
    Modified,
    Removed,
    /// Rewritten with no semantic change.
    Touched,
    /// Loaded from disk.
    Hydrated,
}

impl EventKind {
    fn priority(self) -> u8 {
        match self {
            EventKind::Hydrated => 0,
            EventKind::Touched => 1,
            EventKind::Modified => 2,
            EventKind::Added => 3,
            EventKind::Removed => 4,
        }
    }

    /// Fold `incoming` into what is already pending for a path. `None`
    /// means the two cancel out and nothing is delivered.
    pub fn merge(pending: Option<EventKind>, incoming: EventKind) -> Option<EventKind> {
        use EventKind::*;

        let Some(pending) = pending else {
            return Some(incoming);
        };
        match (pending, incoming) {
            (Added, Removed) => None,
            (Added, _) => Some(Added),
            (Removed, Removed) => Some(Removed),
            (Removed, _) => Some(Added),
            (_, Removed) => Some(Removed),
            (a, b) if a.priority() >= b.priority() => Some(a),
            (_, b) => Some(b),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Added => "added",
            EventKind::Modified => "modified",
            EventKind::Removed => "removed",
            EventKind::Touched => "touched",
            EventKind::Hydrated => "hydrated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: Path,
    pub kind: EventKind,
}

/// Called with each delivered event and the document's current value
/// (`None` once removed).
pub type Observer = Rc<dyn Fn(&ChangeEvent, Option<&JsonValue>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct BroadcastManager {
    /// Merged kind per path, with the arrival order of the first event.
    pending: BTreeMap<Path, (u64, EventKind)>,
    next_seq: u64,
    observers: PathTrie<Vec<(ObserverId, Observer)>>,
    next_observer: u64,
}

impl BroadcastManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event. Returns whether an event for `path` is still pending
    /// after merging.
    pub fn enqueue(&mut self, path: &Path, kind: EventKind) -> bool {
        let current = self.pending.get(path).map(|(_, kind)| *kind);
        match EventKind::merge(current, kind) {
            Some(merged) => {
                match self.pending.get_mut(path) {
                    Some(entry) => entry.1 = merged,
                    None => {
                        self.pending.insert(path.clone(), (self.next_seq, merged));
                        self.next_seq += 1;
                    }
                }
                true
            }
            None => {
                self.pending.remove(path);
                false
            }
        }
    }

    /// Queue removal of every document in `existing` (all under `prefix`)
    /// and drop every other pending event under `prefix`.
    pub fn enqueue_removal_under(
        &mut self,
        prefix: &Path,
        existing: impl IntoIterator<Item = Path>,
    ) {
        for path in existing {
            self.enqueue(&path, EventKind::Removed);
        }
        self.pending
            .retain(|path, (_, kind)| !path.has_prefix(prefix) || *kind == EventKind::Removed);
    }

    /// Every pending event in arrival order, leaving the queue empty.
    pub fn take_pending(&mut self) -> Vec<ChangeEvent> {
        let pending = std::mem::take(&mut self.pending);
        Self::ordered(pending.into_iter())
    }

    /// Every pending event in arrival order.
    pub fn pending(&self) -> Vec<ChangeEvent> {
        Self::ordered(self.pending.iter().map(|(p, e)| (p.clone(), *e)))
    }

    fn ordered(events: impl Iterator<Item = (Path, (u64, EventKind))>) -> Vec<ChangeEvent> {
        let mut events: Vec<_> = events.collect();
        events.sort_by_key(|(_, (seq, _))| *seq);
        events
            .into_iter()
            .map(|(path, (_, kind))| ChangeEvent { path, kind })
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drop every pending event.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn register(&mut self, path: &Path, observer: Observer) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;

        match self.observers.get_mut(path) {
            Some(list) => list.push((id, observer)),
            None => {
                self.observers.insert(path, vec![(id, observer)]);
            }
        }
        id
    }

    pub fn unregister(&mut self, path: &Path, id: ObserverId) -> bool {
        let Some(list) = self.observers.get_mut(path) else {
            return false;
        };
        let before = list.len();
        list.retain(|(registered, _)| *registered != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.observers.remove(path);
        }
        removed
    }

    /// Observers registered on `path` or any of its ancestors, outermost
    /// first.
    pub fn observers_for(&self, path: &Path) -> Vec<Observer> {
        self.observers
            .values_along(path)
            .into_iter()
            .flat_map(|(_, list)| list.iter().map(|(_, observer)| observer.clone()))
            .collect()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.iter().map(|(_, list)| list.len()).sum()
    }
}

impl fmt::Debug for BroadcastManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastManager")
            .field("pending", &self.pending())
            .field("observers", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_core_store::path;
    use std::cell::RefCell;
    use EventKind::*;

    fn events(manager: &mut BroadcastManager) -> Vec<(String, EventKind)> {
        manager
            .take_pending()
            .into_iter()
            .map(|e| (e.path.to_string(), e.kind))
            .collect()
    }

    #[test]
    fn merge_table() {
        assert_eq!(EventKind::merge(None, Modified), Some(Modified));
        assert_eq!(EventKind::merge(Some(Added), Removed), None);
        assert_eq!(EventKind::merge(Some(Added), Modified), Some(Added));
        assert_eq!(EventKind::merge(Some(Added), Hydrated), Some(Added));
        assert_eq!(EventKind::merge(Some(Removed), Removed), Some(Removed));
        assert_eq!(EventKind::merge(Some(Removed), Modified), Some(Added));
        assert_eq!(EventKind::merge(Some(Removed), Touched), Some(Added));
        assert_eq!(EventKind::merge(Some(Modified), Removed), Some(Removed));
        assert_eq!(EventKind::merge(Some(Touched), Removed), Some(Removed));
        assert_eq!(EventKind::merge(Some(Touched), Modified), Some(Modified));
        assert_eq!(EventKind::merge(Some(Modified), Touched), Some(Modified));
        assert_eq!(EventKind::merge(Some(Hydrated), Touched), Some(Touched));
        assert_eq!(EventKind::merge(Some(Hydrated), Added), Some(Added));
    }

    #[test]
    fn add_modify_modify_is_one_added() {
        let mut manager = BroadcastManager::new();
        manager.enqueue(&path!("posts/1"), Added);
        manager.enqueue(&path!("posts/1"), Modified);
        manager.enqueue(&path!("posts/1"), Modified);

        assert_eq!(events(&mut manager), vec![("posts/1".to_string(), Added)]);
        assert!(!manager.has_pending());
    }

    #[test]
    fn add_then_remove_cancels() {
        let mut manager = BroadcastManager::new();
        assert!(manager.enqueue(&path!("posts/1"), Added));
        assert!(!manager.enqueue(&path!("posts/1"), Removed));
        assert!(events(&mut manager).is_empty());

        // Re-adding after cancellation is a fresh event.
        manager.enqueue(&path!("posts/1"), Modified);
        assert_eq!(events(&mut manager), vec![("posts/1".to_string(), Modified)]);
    }

    #[test]
    fn delivery_follows_first_arrival() {
        let mut manager = BroadcastManager::new();
        manager.enqueue(&path!("posts/2"), Added);
        manager.enqueue(&path!("posts/1"), Modified);
        manager.enqueue(&path!("posts/2"), Modified);

        assert_eq!(
            events(&mut manager),
            vec![
                ("posts/2".to_string(), Added),
                ("posts/1".to_string(), Modified)
            ]
        );
    }

    #[test]
    fn subtree_removal_drops_nested_events() {
        let mut manager = BroadcastManager::new();
        manager.enqueue(&path!("posts/1"), Modified);
        manager.enqueue(&path!("posts/2"), Added);
        manager.enqueue(&path!("posts/1/comments/a"), Touched);
        manager.enqueue(&path!("users/1"), Modified);

        manager.enqueue_removal_under(
            &path!("posts"),
            vec![
                path!("posts/1"),
                path!("posts/1/comments/a"),
                path!("posts/2"),
            ],
        );

        assert_eq!(
            events(&mut manager),
            vec![
                ("posts/1".to_string(), Removed),
                ("posts/1/comments/a".to_string(), Removed),
                ("users/1".to_string(), Modified),
            ]
        );
    }

    #[test]
    fn observers_include_ancestors_only() {
        let mut manager = BroadcastManager::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let observer = |tag: &'static str| -> Observer {
            let calls = calls.clone();
            Rc::new(move |_: &ChangeEvent, _: Option<&JsonValue>| calls.borrow_mut().push(tag))
        };

        manager.register(&path!("posts"), observer("collection"));
        manager.register(&path!("posts/1"), observer("document"));
        manager.register(&path!("posts/1/comments/a"), observer("nested"));

        let event = ChangeEvent {
            path: path!("posts/1"),
            kind: Modified,
        };
        for observer in manager.observers_for(&event.path) {
            observer(&event, None);
        }
        assert_eq!(*calls.borrow(), vec!["collection", "document"]);
        assert_eq!(manager.observer_count(), 3);
    }

    #[test]
    fn unregister_removes_only_that_observer() {
        let mut manager = BroadcastManager::new();
        let noop: Observer = Rc::new(|_: &ChangeEvent, _: Option<&JsonValue>| {});
        let a = manager.register(&path!("posts"), noop.clone());
        let b = manager.register(&path!("posts"), noop);

        assert!(manager.unregister(&path!("posts"), a));
        assert!(!manager.unregister(&path!("posts"), a));
        assert_eq!(manager.observers_for(&path!("posts/1")).len(), 1);
        assert!(manager.unregister(&path!("posts"), b));
        assert_eq!(manager.observer_count(), 0);
    }

    #[test]
    fn kinds_serialize_lowercase() {
        let event = ChangeEvent {
            path: path!("posts/1"),
            kind: Hydrated,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"path": "posts/1", "kind": "hydrated"})
        );
        assert_eq!(Removed.to_string(), "removed");
    }
}
