//! A generic prefix trie keyed by path components.
//!
//! `PathTrie<T>` provides O(k) operations where k is the path depth.
//! Each node can optionally hold a value, and has children indexed by path component.

use std::collections::BTreeMap;

use crate::Path;

/// A prefix trie keyed by path components.
///
/// Each node can optionally hold a value of type T, and has children
/// indexed by path component strings. This provides O(k) operations
/// where k is the path depth.
///
/// The document index is a `PathTrie<serde_json::Value>`: documents are
/// values at even depths, collections are the routing nodes between them.
///
/// # Example
///
/// ```rust
/// use stash_core_store::{PathTrie, path};
///
/// let mut trie: PathTrie<i32> = PathTrie::new();
/// trie.insert(&path!("posts/1"), 1);
/// trie.insert(&path!("posts/2"), 2);
///
/// assert_eq!(trie.get(&path!("posts/1")), Some(&1));
/// assert_eq!(trie.get_all(&path!("posts")).unwrap().len(), 2);
/// assert!(trie.get_all(&path!("users")).is_none());
/// ```
#[derive(Debug, Clone)]
pub struct PathTrie<T> {
    value: Option<T>,
    children: BTreeMap<String, PathTrie<T>>,
}

impl<T> Default for PathTrie<T> {
    fn default() -> Self {
        Self {
            value: None,
            children: BTreeMap::new(),
        }
    }
}

impl<T> PathTrie<T> {
    /// Create an empty trie.
    pub fn new() -> Self {
        Self::default()
    }

    /// Navigate to node, creating intermediate nodes as needed.
    fn get_or_create_node(&mut self, path: &Path) -> &mut PathTrie<T> {
        let mut current = self;
        for component in &path.components {
            current = current.children.entry(component.clone()).or_default();
        }
        current
    }

    /// Navigate to node if it exists.
    fn get_node(&self, path: &Path) -> Option<&PathTrie<T>> {
        let mut current = self;
        for component in &path.components {
            current = current.children.get(component)?;
        }
        Some(current)
    }

    /// Navigate to node if it exists (mutable).
    fn get_node_mut(&mut self, path: &Path) -> Option<&mut PathTrie<T>> {
        let mut current = self;
        for component in &path.components {
            current = current.children.get_mut(component)?;
        }
        Some(current)
    }

    /// Insert a value at path. Returns previous value if any.
    pub fn insert(&mut self, path: &Path, value: T) -> Option<T> {
        let node = self.get_or_create_node(path);
        node.value.replace(value)
    }

    /// Remove and return value at exact path. Children remain.
    pub fn remove(&mut self, path: &Path) -> Option<T> {
        self.get_node_mut(path)?.value.take()
    }

    /// Remove and return entire subtree at path.
    ///
    /// The parent node is kept even if this leaves it without children, so
    /// a collection emptied one document at a time still exists.
    pub fn remove_subtree(&mut self, path: &Path) -> Option<PathTrie<T>> {
        if path.is_empty() {
            let old = std::mem::take(self);
            if old.value.is_some() || !old.children.is_empty() {
                Some(old)
            } else {
                None
            }
        } else {
            let parent_path = path.slice(0, path.len() - 1);
            let child_name = &path.components[path.len() - 1];
            let parent = self.get_node_mut(&parent_path)?;
            parent.children.remove(child_name)
        }
    }

    /// Drop every value and node.
    pub fn clear(&mut self) {
        self.value = None;
        self.children.clear();
    }

    /// Get reference to value at exact path.
    pub fn get(&self, path: &Path) -> Option<&T> {
        self.get_node(path)?.value.as_ref()
    }

    /// Get mutable reference to value at exact path.
    pub fn get_mut(&mut self, path: &Path) -> Option<&mut T> {
        self.get_node_mut(path)?.value.as_mut()
    }

    /// Values of the direct children of the node at `path`, keyed by the
    /// child segment.
    ///
    /// Returns `None` when no node exists at `path` (never written, or
    /// removed as a subtree), and an empty map when the node exists but
    /// none of its children currently hold a value.
    pub fn get_all(&self, path: &Path) -> Option<BTreeMap<String, &T>> {
        let node = self.get_node(path)?;
        Some(
            node.children
                .iter()
                .filter_map(|(name, child)| child.value.as_ref().map(|v| (name.clone(), v)))
                .collect(),
        )
    }

    /// Get reference to subtrie at path.
    pub fn get_subtrie(&self, path: &Path) -> Option<&PathTrie<T>> {
        self.get_node(path)
    }

    /// Check if exact path has a value.
    pub fn contains(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    /// Check if a node (valued or not) exists at path.
    pub fn contains_node(&self, path: &Path) -> bool {
        self.get_node(path).is_some()
    }

    /// The value held directly by this node.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Direct children of this node.
    pub fn children(&self) -> impl Iterator<Item = (&String, &PathTrie<T>)> {
        self.children.iter()
    }

    /// Values stored at every prefix of `path`, from the root down to the
    /// exact path. Stops at the first missing segment.
    pub fn values_along<'a>(&'a self, path: &Path) -> Vec<(usize, &'a T)> {
        let mut found = Vec::new();
        let mut current = self;
        if let Some(v) = current.value.as_ref() {
            found.push((0, v));
        }
        for (depth, component) in path.components.iter().enumerate() {
            match current.children.get(component) {
                Some(child) => {
                    current = child;
                    if let Some(v) = child.value.as_ref() {
                        found.push((depth + 1, v));
                    }
                }
                None => break,
            }
        }
        found
    }

    /// Count of values in trie (not nodes).
    pub fn len(&self) -> usize {
        let self_count = if self.value.is_some() { 1 } else { 0 };
        let children_count: usize = self.children.values().map(|child| child.len()).sum();
        self_count + children_count
    }

    /// True if no values anywhere in trie.
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.values().all(|c| c.is_empty())
    }

    /// Iterate over all (path, value) pairs.
    pub fn iter(&self) -> PathTrieIter<'_, T> {
        PathTrieIter::new(Path::root(), self)
    }

    /// Iterate over all (path, value) pairs at or below `path`, yielding
    /// full paths.
    pub fn iter_prefix(&self, path: &Path) -> PathTrieIter<'_, T> {
        match self.get_node(path) {
            Some(node) => PathTrieIter::new(path.clone(), node),
            None => PathTrieIter { stack: Vec::new() },
        }
    }
}

/// Iterator over (Path, &T) pairs in a PathTrie.
pub struct PathTrieIter<'a, T> {
    stack: Vec<(Path, &'a PathTrie<T>)>,
}

impl<'a, T> PathTrieIter<'a, T> {
    fn new(base: Path, trie: &'a PathTrie<T>) -> Self {
        Self {
            stack: vec![(base, trie)],
        }
    }
}

impl<'a, T> Iterator for PathTrieIter<'a, T> {
    type Item = (Path, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((path, node)) = self.stack.pop() {
            // Reverse so children pop in key order
            for (name, child) in node.children.iter().rev() {
                let mut components = path.components.clone();
                components.push(name.clone());
                self.stack.push((Path { components }, child));
            }

            if let Some(ref value) = node.value {
                return Some((path, value));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;

    #[test]
    fn new_trie_is_empty() {
        let trie: PathTrie<i32> = PathTrie::new();
        assert!(trie.is_empty());
        assert_eq!(trie.len(), 0);
    }

    #[test]
    fn insert_and_get() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        trie.insert(&path!("a/b"), 42);

        assert_eq!(trie.get(&path!("a/b")), Some(&42));
        assert_eq!(trie.get(&path!("a")), None);
        assert_eq!(trie.get(&path!("a/b/c")), None);
    }

    #[test]
    fn missing_intermediate_is_not_found() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        trie.insert(&path!("users/alice/posts/1"), 1);

        assert_eq!(trie.get(&path!("users/bob/posts/1")), None);
        assert!(trie.get_all(&path!("users/bob/posts")).is_none());
    }

    #[test]
    fn insert_returns_previous() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        assert_eq!(trie.insert(&path!("a"), 1), None);
        assert_eq!(trie.insert(&path!("a"), 2), Some(1));
        assert_eq!(trie.get(&path!("a")), Some(&2));
    }

    #[test]
    fn remove_keeps_children() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        trie.insert(&path!("a"), 1);
        trie.insert(&path!("a/b"), 2);

        assert_eq!(trie.remove(&path!("a")), Some(1));

        assert_eq!(trie.get(&path!("a")), None);
        assert_eq!(trie.get(&path!("a/b")), Some(&2));
    }

    #[test]
    fn remove_subtree() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        trie.insert(&path!("a"), 1);
        trie.insert(&path!("a/b"), 2);
        trie.insert(&path!("c"), 3);

        let subtree = trie.remove_subtree(&path!("a")).unwrap();

        assert_eq!(subtree.get(&path!("")), Some(&1));
        assert_eq!(subtree.get(&path!("b")), Some(&2));
        assert_eq!(trie.get(&path!("a")), None);
        assert_eq!(trie.get(&path!("a/b")), None);
        assert_eq!(trie.get(&path!("c")), Some(&3));
    }

    #[test]
    fn remove_subtree_at_root() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        trie.insert(&path!("a"), 1);
        trie.insert(&path!("b"), 2);

        let subtree = trie.remove_subtree(&path!("")).unwrap();

        assert!(trie.is_empty());
        assert_eq!(subtree.get(&path!("a")), Some(&1));
        assert_eq!(subtree.get(&path!("b")), Some(&2));
    }

    #[test]
    fn remove_subtree_nonexistent() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        trie.insert(&path!("a"), 1);

        assert!(trie.remove_subtree(&path!("nonexistent")).is_none());
        assert!(PathTrie::<i32>::new().remove_subtree(&path!("")).is_none());
    }

    #[test]
    fn get_all_distinguishes_missing_from_empty() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        assert!(trie.get_all(&path!("posts")).is_none());

        trie.insert(&path!("posts/1"), 1);
        trie.insert(&path!("posts/2"), 2);
        trie.insert(&path!("posts/1/comments/9"), 9);

        let all = trie.get_all(&path!("posts")).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("1"), Some(&&1));
        assert_eq!(all.get("2"), Some(&&2));

        trie.remove_subtree(&path!("posts/1"));
        trie.remove_subtree(&path!("posts/2"));
        assert_eq!(trie.get_all(&path!("posts")).unwrap().len(), 0);

        trie.remove_subtree(&path!("posts"));
        assert!(trie.get_all(&path!("posts")).is_none());
    }

    #[test]
    fn contains() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        trie.insert(&path!("a/b"), 1);

        assert!(trie.contains(&path!("a/b")));
        assert!(!trie.contains(&path!("a")));
        assert!(trie.contains_node(&path!("a")));
        assert!(!trie.contains(&path!("nonexistent")));
    }

    #[test]
    fn clear_drops_everything() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        trie.insert(&path!("a/b"), 1);
        trie.insert(&path!(""), 0);
        trie.clear();

        assert!(trie.is_empty());
        assert!(!trie.contains_node(&path!("a")));
    }

    #[test]
    fn len_counts_values() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        trie.insert(&path!("a"), 1);
        trie.insert(&path!("a/b"), 2);
        trie.insert(&path!("c"), 3);
        assert_eq!(trie.len(), 3);
    }

    #[test]
    fn values_along_collects_ancestors() {
        let mut trie: PathTrie<&str> = PathTrie::new();
        trie.insert(&path!("users"), "collection");
        trie.insert(&path!("users/alice"), "doc");
        trie.insert(&path!("users/alice/posts/1"), "nested");

        let found = trie.values_along(&path!("users/alice/posts/1"));
        assert_eq!(found, vec![(1, &"collection"), (2, &"doc"), (4, &"nested")]);

        let found = trie.values_along(&path!("users/bob"));
        assert_eq!(found, vec![(1, &"collection")]);
    }

    #[test]
    fn iter_all_values() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        trie.insert(&path!("a"), 1);
        trie.insert(&path!("b"), 2);
        trie.insert(&path!("a/c"), 3);

        let items: Vec<_> = trie.iter().collect();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0], (path!("a"), &1));
        assert_eq!(items[1], (path!("a/c"), &3));
        assert_eq!(items[2], (path!("b"), &2));
    }

    #[test]
    fn iter_prefix_yields_full_paths() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        trie.insert(&path!("posts/1"), 1);
        trie.insert(&path!("posts/1/comments/2"), 2);
        trie.insert(&path!("users/1"), 3);

        let items: Vec<_> = trie.iter_prefix(&path!("posts")).map(|(p, _)| p).collect();
        assert_eq!(items, vec![path!("posts/1"), path!("posts/1/comments/2")]);
        assert_eq!(trie.iter_prefix(&path!("nothing")).count(), 0);
    }

    #[test]
    fn iter_root_value() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        trie.insert(&path!(""), 42);

        let items: Vec<_> = trie.iter().collect();
        assert_eq!(items, vec![(path!(""), &42)]);
    }

    #[test]
    fn is_empty_with_only_structure() {
        let mut trie: PathTrie<i32> = PathTrie::new();
        trie.insert(&path!("a/b/c"), 1);
        trie.remove(&path!("a/b/c"));

        assert!(trie.is_empty());
    }
}
