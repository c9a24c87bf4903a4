//! A path trie whose nodes carry a reference count and/or an assigned value.
//!
//! Two users in the workspace:
//! - dependency tracking counts how many documents depend on each path;
//! - shard resolution assigns each document path the name of its shard.
//!
//! A node is retained while it has a count, an assigned value, or at least
//! one child. Everything else is pruned on the mutation that empties it.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::{Error, Path};

/// Snapshot key holding a node's count when it cannot be the node itself.
pub const REF_KEY: &str = "ref";
/// Snapshot key holding a node's assigned value when it has children.
pub const VALUE_KEY: &str = "value";
/// Prefixed to a segment named like a reserved key (or already starting
/// with the prefix) when it appears as a child key in a snapshot.
pub const ESCAPE_PREFIX: char = '~';

/// What a single node holds, independent of its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState<T> {
    Empty,
    Count(u32),
    Value(T),
    Both(u32, T),
}

impl<T> NodeState<T> {
    pub fn count(&self) -> u32 {
        match self {
            NodeState::Count(n) | NodeState::Both(n, _) => *n,
            NodeState::Empty | NodeState::Value(_) => 0,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            NodeState::Value(v) | NodeState::Both(_, v) => Some(v),
            NodeState::Empty | NodeState::Count(_) => None,
        }
    }

    fn into_parts(self) -> (u32, Option<T>) {
        match self {
            NodeState::Empty => (0, None),
            NodeState::Count(n) => (n, None),
            NodeState::Value(v) => (0, Some(v)),
            NodeState::Both(n, v) => (n, Some(v)),
        }
    }

    fn from_parts(count: u32, value: Option<T>) -> Self {
        match (count, value) {
            (0, None) => NodeState::Empty,
            (n, None) => NodeState::Count(n),
            (0, Some(v)) => NodeState::Value(v),
            (n, Some(v)) => NodeState::Both(n, v),
        }
    }
}

#[derive(Debug, Clone)]
struct RefNode<T> {
    state: NodeState<T>,
    children: BTreeMap<String, RefNode<T>>,
}

impl<T> Default for RefNode<T> {
    fn default() -> Self {
        Self {
            state: NodeState::Empty,
            children: BTreeMap::new(),
        }
    }
}

impl<T> RefNode<T> {
    fn is_retained(&self) -> bool {
        !matches!(self.state, NodeState::Empty) || !self.children.is_empty()
    }

    fn set_count(&mut self, count: u32) {
        let (_, value) = std::mem::replace(&mut self.state, NodeState::Empty).into_parts();
        self.state = NodeState::from_parts(count, value);
    }

    fn set_value(&mut self, value: Option<T>) -> Option<T> {
        let (count, old) = std::mem::replace(&mut self.state, NodeState::Empty).into_parts();
        self.state = NodeState::from_parts(count, value);
        old
    }

    /// Apply `f` to the node at `components[depth..]` and prune every node
    /// on the way back up that is no longer retained. `None` means the node
    /// does not exist or `f` declined.
    fn mutate<R>(
        &mut self,
        components: &[String],
        depth: usize,
        f: impl FnOnce(&mut RefNode<T>) -> Option<R>,
    ) -> Option<R> {
        if depth == components.len() {
            return f(self);
        }
        let key = &components[depth];
        let child = self.children.get_mut(key)?;
        let result = child.mutate(components, depth + 1, f);
        if !child.is_retained() {
            self.children.remove(key);
        }
        result
    }
}

/// A path trie of reference counts and assigned values.
///
/// # Example
///
/// ```rust
/// use stash_core_store::{RefCountedPathStore, path};
/// use serde_json::json;
///
/// let mut store: RefCountedPathStore = RefCountedPathStore::new();
/// store.inc(&path!("posts/1"));
/// store.inc(&path!("posts/1"));
/// store.inc(&path!("posts/1/comments/2"));
/// store.inc(&path!("posts/2"));
///
/// assert_eq!(
///     store.inspect(),
///     json!({"posts": {"1": {"ref": 2, "comments": {"2": 1}}, "2": 1}})
/// );
/// ```
#[derive(Debug, Clone)]
pub struct RefCountedPathStore<T = String> {
    root: RefNode<T>,
}

impl<T> Default for RefCountedPathStore<T> {
    fn default() -> Self {
        Self {
            root: RefNode::default(),
        }
    }
}

impl<T> RefCountedPathStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_node(&self, path: &Path) -> Option<&RefNode<T>> {
        let mut current = &self.root;
        for component in &path.components {
            current = current.children.get(component)?;
        }
        Some(current)
    }

    fn get_or_create_node(&mut self, path: &Path) -> &mut RefNode<T> {
        let mut current = &mut self.root;
        for component in &path.components {
            current = current.children.entry(component.clone()).or_default();
        }
        current
    }

    /// Increment the count at `path`, creating routing nodes as needed.
    /// Returns the new count.
    pub fn inc(&mut self, path: &Path) -> u32 {
        let node = self.get_or_create_node(path);
        let count = node.state.count().saturating_add(1);
        node.set_count(count);
        count
    }

    /// Decrement the count at `path`. Returns the new count.
    ///
    /// A node left with no count, no value and no children is pruned, and
    /// pruning cascades through ancestors in the same condition. A path
    /// whose count is already zero is left untouched and reported as
    /// [`Error::RefCountUnderflow`].
    pub fn dec(&mut self, path: &Path) -> Result<u32, Error> {
        let result = self.root.mutate(&path.components, 0, |node| {
            let count = node.state.count();
            if count == 0 {
                return None;
            }
            node.set_count(count - 1);
            Some(count - 1)
        });

        result.ok_or_else(|| {
            log::error!("reference count underflow at '{}'", path);
            Error::RefCountUnderflow { path: path.clone() }
        })
    }

    /// Assign a value to `path`, returning the previous one.
    pub fn assign(&mut self, path: &Path, value: T) -> Option<T> {
        self.get_or_create_node(path).set_value(Some(value))
    }

    /// Clear the value at `path`, pruning like [`dec`](Self::dec).
    pub fn unassign(&mut self, path: &Path) -> Option<T> {
        self.root
            .mutate(&path.components, 0, |node| node.set_value(None))
    }

    /// Remove every assignment at or below `path`, returning them.
    ///
    /// Counts are kept; only nodes left empty are pruned.
    pub fn unassign_subtree(&mut self, path: &Path) -> Vec<(Path, T)> {
        let taken = self.root.mutate(&path.components, 0, |node| {
            let mut taken = Vec::new();
            take_values(node, path.clone(), &mut taken);
            Some(taken)
        });
        taken.unwrap_or_default()
    }

    /// Current count at `path`; zero when absent.
    pub fn count(&self, path: &Path) -> u32 {
        self.get_node(path).map(|n| n.state.count()).unwrap_or(0)
    }

    /// True if `path` has a count above zero.
    pub fn is_referenced(&self, path: &Path) -> bool {
        self.count(path) > 0
    }

    /// The value assigned at `path`.
    pub fn assigned(&self, path: &Path) -> Option<&T> {
        self.get_node(path)?.state.value()
    }

    /// The state of the node at `path`, if the node exists.
    pub fn state(&self, path: &Path) -> Option<&NodeState<T>> {
        self.get_node(path).map(|n| &n.state)
    }

    /// True if a node (counted, assigned or transient) exists at `path`.
    pub fn contains(&self, path: &Path) -> bool {
        self.get_node(path).is_some()
    }

    /// All assignments, in path order.
    pub fn assignments(&self) -> Vec<(Path, &T)> {
        self.assignments_under(&Path::root())
    }

    /// All assignments at or below `path`, in path order.
    pub fn assignments_under(&self, path: &Path) -> Vec<(Path, &T)> {
        let mut found = Vec::new();
        let Some(start) = self.get_node(path) else {
            return found;
        };

        let mut stack = vec![(path.clone(), start)];
        while let Some((node_path, node)) = stack.pop() {
            for (name, child) in node.children.iter().rev() {
                let mut components = node_path.components.clone();
                components.push(name.clone());
                stack.push((Path { components }, child));
            }
            if let Some(v) = node.state.value() {
                found.push((node_path, v));
            }
        }
        found
    }

    pub fn clear(&mut self) {
        self.root = RefNode::default();
    }

    pub fn is_empty(&self) -> bool {
        !self.root.is_retained()
    }
}

fn take_values<T>(node: &mut RefNode<T>, path: Path, out: &mut Vec<(Path, T)>) {
    if let Some(v) = node.set_value(None) {
        out.push((path.clone(), v));
    }
    for (name, child) in node.children.iter_mut() {
        let mut components = path.components.clone();
        components.push(name.clone());
        take_values(child, Path { components }, out);
    }
    node.children.retain(|_, child| child.is_retained());
}

impl<T: Serialize> RefCountedPathStore<T> {
    /// Serializable snapshot of the store.
    ///
    /// - a childless node holding only a count is the count itself;
    /// - a childless node holding only a value is the value itself;
    /// - any other node is an object of its children plus `"ref"` (count,
    ///   when non-zero) and `"value"` (assigned value, when present).
    ///
    /// Child segments named `ref` or `value` are written as `~ref` and
    /// `~value`, and a segment starting with `~` gains one more `~`.
    ///
    /// Assigned values should not serialize to JSON numbers or objects,
    /// otherwise the snapshot cannot be read back unambiguously.
    pub fn inspect(&self) -> JsonValue {
        JsonValue::Object(node_object(&self.root))
    }
}

fn node_object<T: Serialize>(node: &RefNode<T>) -> Map<String, JsonValue> {
    let mut object = Map::new();
    let count = node.state.count();
    if count > 0 {
        object.insert(REF_KEY.to_string(), JsonValue::from(count));
    }
    if let Some(v) = node.state.value() {
        object.insert(VALUE_KEY.to_string(), value_json(v));
    }
    for (name, child) in &node.children {
        object.insert(escape_segment(name).into_owned(), node_json(child));
    }
    object
}

fn node_json<T: Serialize>(node: &RefNode<T>) -> JsonValue {
    if node.children.is_empty() {
        match &node.state {
            NodeState::Count(n) => return JsonValue::from(*n),
            NodeState::Value(v) => return value_json(v),
            NodeState::Empty | NodeState::Both(_, _) => {}
        }
    }
    JsonValue::Object(node_object(node))
}

fn escape_segment(name: &str) -> Cow<'_, str> {
    if name == REF_KEY || name == VALUE_KEY || name.starts_with(ESCAPE_PREFIX) {
        Cow::Owned(format!("{}{}", ESCAPE_PREFIX, name))
    } else {
        Cow::Borrowed(name)
    }
}

fn unescape_segment(key: &str) -> &str {
    key.strip_prefix(ESCAPE_PREFIX).unwrap_or(key)
}

fn value_json<T: Serialize>(value: &T) -> JsonValue {
    serde_json::to_value(value).unwrap_or_else(|e| {
        log::error!("failed to serialize assigned value: {}", e);
        JsonValue::Null
    })
}

impl<T: DeserializeOwned> RefCountedPathStore<T> {
    /// Rebuild a store from an [`inspect`](Self::inspect) snapshot.
    pub fn from_snapshot(snapshot: &JsonValue) -> Result<Self, Error> {
        let JsonValue::Object(object) = snapshot else {
            return Err(Error::snapshot("root must be an object"));
        };
        Ok(Self {
            root: parse_object(object)?,
        })
    }
}

fn parse_count(value: &JsonValue) -> Result<u32, Error> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| Error::snapshot(format!("invalid count {}", value)))
}

fn parse_value<T: DeserializeOwned>(value: &JsonValue) -> Result<T, Error> {
    serde_json::from_value(value.clone()).map_err(|e| Error::snapshot(e.to_string()))
}

fn parse_object<T: DeserializeOwned>(object: &Map<String, JsonValue>) -> Result<RefNode<T>, Error> {
    let mut node = RefNode::default();
    let mut count = 0;
    let mut value = None;
    for (key, child) in object {
        match key.as_str() {
            REF_KEY => count = parse_count(child)?,
            VALUE_KEY => value = Some(parse_value(child)?),
            _ => {
                let child_node = parse_node(child)?;
                if child_node.is_retained() {
                    node.children
                        .insert(unescape_segment(key).to_string(), child_node);
                }
            }
        }
    }
    node.state = NodeState::from_parts(count, value);
    Ok(node)
}

fn parse_node<T: DeserializeOwned>(value: &JsonValue) -> Result<RefNode<T>, Error> {
    match value {
        JsonValue::Number(_) => Ok(RefNode {
            state: NodeState::from_parts(parse_count(value)?, None),
            children: BTreeMap::new(),
        }),
        JsonValue::Object(object) => parse_object(object),
        other => Ok(RefNode {
            state: NodeState::Value(parse_value(other)?),
            children: BTreeMap::new(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use serde_json::json;

    fn counts() -> RefCountedPathStore<String> {
        RefCountedPathStore::new()
    }

    #[test]
    fn inc_creates_leaf_count() {
        let mut store = counts();
        assert_eq!(store.inc(&path!("posts/1")), 1);
        assert_eq!(store.inspect(), json!({"posts": {"1": 1}}));
        assert_eq!(store.count(&path!("posts")), 0);
        assert!(store.contains(&path!("posts")));
    }

    #[test]
    fn transient_node_keeps_explicit_ref() {
        let mut store = counts();
        store.inc(&path!("posts/1"));
        store.inc(&path!("posts/1"));
        store.inc(&path!("posts/1/comments/2"));
        store.inc(&path!("posts/2"));
        assert_eq!(
            store.inspect(),
            json!({"posts": {"1": {"ref": 2, "comments": {"2": 1}}, "2": 1}})
        );

        assert_eq!(store.dec(&path!("posts/1")).unwrap(), 1);
        assert_eq!(store.dec(&path!("posts/1")).unwrap(), 0);
        assert_eq!(
            store.inspect(),
            json!({"posts": {"1": {"comments": {"2": 1}}, "2": 1}})
        );
        assert_eq!(
            store.state(&path!("posts/1")),
            Some(&NodeState::Empty),
            "routing node kept for its child"
        );
    }

    #[test]
    fn dec_prunes_cascading() {
        let mut store = counts();
        store.inc(&path!("posts/1/comments/2"));
        store.dec(&path!("posts/1/comments/2")).unwrap();

        assert!(store.is_empty());
        assert_eq!(store.inspect(), json!({}));
        assert!(!store.contains(&path!("posts")));
    }

    #[test]
    fn dec_stops_pruning_at_referenced_ancestor() {
        let mut store = counts();
        store.inc(&path!("posts/1"));
        store.inc(&path!("posts/1/comments/2"));
        store.dec(&path!("posts/1/comments/2")).unwrap();

        assert_eq!(store.inspect(), json!({"posts": {"1": 1}}));
    }

    #[test]
    fn dec_underflow_is_error_and_noop() {
        let mut store = counts();
        assert!(matches!(
            store.dec(&path!("posts/1")),
            Err(Error::RefCountUnderflow { .. })
        ));

        store.inc(&path!("posts/1/comments/2"));
        let before = store.inspect();
        assert!(store.dec(&path!("posts/1")).is_err());
        assert_eq!(store.inspect(), before);
    }

    #[test]
    fn assigned_nodes_survive_dec() {
        let mut store = counts();
        store.assign(&path!("posts/1"), "posts".to_string());
        store.inc(&path!("posts/1"));
        assert_eq!(
            store.inspect(),
            json!({"posts": {"1": {"ref": 1, "value": "posts"}}})
        );

        store.dec(&path!("posts/1")).unwrap();
        assert_eq!(store.inspect(), json!({"posts": {"1": "posts"}}));
        assert_eq!(store.assigned(&path!("posts/1")).map(String::as_str), Some("posts"));
    }

    #[test]
    fn unassign_prunes() {
        let mut store = counts();
        store.assign(&path!("posts/1"), "a".to_string());
        assert_eq!(store.assign(&path!("posts/1"), "b".to_string()), Some("a".to_string()));
        assert_eq!(store.unassign(&path!("posts/1")), Some("b".to_string()));
        assert!(store.is_empty());
        assert_eq!(store.unassign(&path!("posts/1")), None);
    }

    #[test]
    fn unassign_subtree_takes_nested_values() {
        let mut store = counts();
        store.assign(&path!("users/a"), "users".to_string());
        store.assign(&path!("users/a/posts/1"), "posts".to_string());
        store.assign(&path!("users/b"), "users".to_string());
        store.assign(&path!("other/x"), "other".to_string());
        store.inc(&path!("users/b"));

        let taken = store.unassign_subtree(&path!("users"));
        assert_eq!(
            taken,
            vec![
                (path!("users/a"), "users".to_string()),
                (path!("users/a/posts/1"), "posts".to_string()),
                (path!("users/b"), "users".to_string()),
            ]
        );
        assert_eq!(store.inspect(), json!({"users": {"b": 1}, "other": {"x": "other"}}));
    }

    #[test]
    fn assignments_in_path_order() {
        let mut store = counts();
        store.assign(&path!("b/1"), "b".to_string());
        store.assign(&path!("a/1"), "a".to_string());
        store.assign(&path!("a/1/c/2"), "c".to_string());

        let all: Vec<_> = store
            .assignments()
            .into_iter()
            .map(|(p, v)| (p.to_string(), v.clone()))
            .collect();
        assert_eq!(
            all,
            vec![
                ("a/1".to_string(), "a".to_string()),
                ("a/1/c/2".to_string(), "c".to_string()),
                ("b/1".to_string(), "b".to_string()),
            ]
        );
        assert_eq!(store.assignments_under(&path!("b")).len(), 1);
        assert!(store.assignments_under(&path!("zzz")).is_empty());
    }

    #[test]
    fn snapshot_roundtrip_preserves_transient_nodes() {
        let mut store = counts();
        store.inc(&path!("posts/1"));
        store.inc(&path!("posts/1/comments/2"));
        store.assign(&path!("posts/2"), "shard".to_string());
        store.assign(&path!("posts/3"), "shard".to_string());
        store.inc(&path!("posts/3"));
        store.assign(&path!("users/u"), "people".to_string());
        store.inc(&path!("users/u/likes/9"));

        let snapshot = store.inspect();
        let restored: RefCountedPathStore<String> =
            RefCountedPathStore::from_snapshot(&snapshot).unwrap();
        assert_eq!(restored.inspect(), snapshot);
        assert_eq!(restored.count(&path!("posts/3")), 1);
        assert_eq!(
            restored.assigned(&path!("users/u")).map(String::as_str),
            Some("people")
        );
    }

    #[test]
    fn reserved_segment_names_survive_snapshot() {
        let mut store = counts();
        store.assign(&path!("users/ref"), "users".to_string());
        store.assign(&path!("users/value"), "users".to_string());
        store.assign(&path!("users/~x"), "users".to_string());
        store.inc(&path!("users/plain"));

        let snapshot = store.inspect();
        assert_eq!(
            snapshot,
            json!({"users": {"~ref": "users", "~value": "users", "~~x": "users", "plain": 1}})
        );

        let restored: RefCountedPathStore<String> =
            RefCountedPathStore::from_snapshot(&snapshot).unwrap();
        assert_eq!(restored.assigned(&path!("users/ref")).map(String::as_str), Some("users"));
        assert_eq!(restored.assigned(&path!("users/value")).map(String::as_str), Some("users"));
        assert_eq!(restored.assigned(&path!("users/~x")).map(String::as_str), Some("users"));
        assert_eq!(restored.count(&path!("users/plain")), 1);
        assert_eq!(restored.count(&path!("users")), 0);
    }

    #[test]
    fn from_snapshot_rejects_garbage() {
        assert!(RefCountedPathStore::<String>::from_snapshot(&json!([1, 2])).is_err());
        assert!(RefCountedPathStore::<String>::from_snapshot(&json!({"a": {"ref": -1}})).is_err());
        assert!(RefCountedPathStore::<String>::from_snapshot(&json!({"a": {"b": true}})).is_err());
    }

    #[test]
    fn root_count() {
        let mut store = counts();
        store.inc(&Path::root());
        assert_eq!(store.inspect(), json!({"ref": 1}));
        store.dec(&Path::root()).unwrap();
        assert!(store.is_empty());
    }
}
