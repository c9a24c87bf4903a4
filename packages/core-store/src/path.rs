//! Slash-delimited document and collection paths.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The delimiter between path segments.
pub const DELIMITER: char = '/';

/// Errors related to path parsing and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// A path component is empty or contains the delimiter.
    InvalidComponent {
        component: String,
        position: usize,
        message: String,
    },
    /// The path string is invalid.
    InvalidPath { message: String },
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathError::InvalidComponent {
                component,
                position,
                message,
            } => {
                write!(
                    f,
                    "invalid path component '{}' at position {}: {}",
                    component, position, message
                )
            }
            PathError::InvalidPath { message } => {
                write!(f, "invalid path: {}", message)
            }
        }
    }
}

impl std::error::Error for PathError {}

/// A path in the store.
///
/// Segments alternate between collection names and document ids, so a
/// path with an odd number of segments names a collection and a path
/// with an even number names a document:
///
/// ```text
/// users             collection
/// users/alice       document
/// users/alice/posts collection nested under a document
/// ```
///
/// The segments are split once at parse time; tries walk them by index.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path {
    pub components: Vec<String>,
}

impl Path {
    /// Parse a path string.
    ///
    /// # Path Syntax
    ///
    /// - Components are separated by `/`
    /// - Empty components are ignored (normalizes `//` and trailing `/`)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use stash_core_store::Path;
    ///
    /// let path = Path::parse("users/alice-123/posts").unwrap();
    /// assert_eq!(path.len(), 3);
    /// assert!(path.is_collection());
    ///
    /// // Trailing slashes are normalized
    /// assert_eq!(Path::parse("foo/bar/").unwrap(), Path::parse("foo/bar").unwrap());
    /// ```
    pub fn parse(s: &str) -> Result<Self, PathError> {
        let components: Vec<String> = s
            .split(DELIMITER)
            .filter(|c| !c.is_empty())
            .map(|c| c.to_string())
            .collect();

        for (i, component) in components.iter().enumerate() {
            Self::validate_component(component, i)?;
        }

        Ok(Path { components })
    }

    /// The root path (no segments).
    pub fn root() -> Self {
        Path {
            components: Vec::new(),
        }
    }

    fn validate_component(component: &str, position: usize) -> Result<(), PathError> {
        if component.is_empty() {
            return Err(PathError::InvalidComponent {
                component: component.to_string(),
                position,
                message: "empty component".to_string(),
            });
        }

        if component.contains(DELIMITER) {
            return Err(PathError::InvalidComponent {
                component: component.to_string(),
                position,
                message: format!("component contains the delimiter '{}'", DELIMITER),
            });
        }

        Ok(())
    }

    /// Check if this path is empty (root path).
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the number of components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// True for paths with an even, non-zero number of segments.
    pub fn is_document(&self) -> bool {
        !self.is_empty() && self.len() % 2 == 0
    }

    /// True for paths with an odd number of segments.
    pub fn is_collection(&self) -> bool {
        self.len() % 2 == 1
    }

    /// The last segment: a document id or a collection name.
    pub fn last(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    /// The first segment, i.e. the root collection this path lives under.
    pub fn root_collection(&self) -> Option<&str> {
        self.components.first().map(String::as_str)
    }

    /// The path with its last segment removed.
    pub fn parent(&self) -> Option<Path> {
        if self.is_empty() {
            None
        } else {
            Some(self.slice(0, self.len() - 1))
        }
    }

    /// Check if this path has the given prefix.
    pub fn has_prefix(&self, prefix: &Path) -> bool {
        prefix.components.len() <= self.components.len()
            && prefix.components == self.components[..prefix.components.len()]
    }

    /// Get a slice of components as a new path.
    pub fn slice(&self, start: usize, end: usize) -> Path {
        Path {
            components: self.components[start..end].to_vec(),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.components.join("/"))
    }
}

impl std::str::FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s)
    }
}

impl TryFrom<String> for Path {
    type Error = PathError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Path::parse(&s)
    }
}

impl From<Path> for String {
    fn from(path: Path) -> Self {
        path.to_string()
    }
}

/// Macro for creating paths from literals.
///
/// # Example
///
/// ```rust
/// use stash_core_store::path;
///
/// let p = path!("users/123/name");
/// assert_eq!(p.len(), 3);
/// ```
#[macro_export]
macro_rules! path {
    ($s:expr) => {
        $crate::Path::parse($s).expect("invalid path literal")
    };
}
