//! Key paths addressing positions in the tree

use smallvec::SmallVec;
use std::fmt;

/// One step of a key path
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => f.write_str(key),
            PathSegment::Index(index) => write!(f, "{}", index),
        }
    }
}

/// Location of a node, from the root mapping down
///
/// Most paths are shallow; SmallVec keeps them off the heap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyPath {
    segments: SmallVec<[PathSegment; 8]>,
}

impl KeyPath {
    /// The root path (`/`)
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a slash-separated path such as `a/b/0`
    ///
    /// Purely numeric segments are kept as keys here; whether they index a
    /// sequence is decided against the tree (see [`KeyPath::resolve_segment`]).
    pub fn parse(text: &str) -> Self {
        let segments = text
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| PathSegment::Key(s.to_string()))
            .collect();
        Self { segments }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment, if any
    pub fn last(&self) -> Option<&PathSegment> {
        self.segments.last()
    }

    /// Path with one more key appended
    pub fn key(&self, key: &str) -> Self {
        let mut next = self.clone();
        next.segments.push(PathSegment::Key(key.to_string()));
        next
    }

    /// Path with one more index appended
    pub fn index(&self, index: usize) -> Self {
        let mut next = self.clone();
        next.segments.push(PathSegment::Index(index));
        next
    }

    /// Path without its last segment
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        let mut parent = self.clone();
        parent.segments.pop();
        Some(parent)
    }

    pub(crate) fn push(&mut self, segment: PathSegment) {
        self.segments.push(segment);
    }

    pub(crate) fn pop(&mut self) {
        self.segments.pop();
    }

    /// Interpret a segment as a sequence index
    pub fn resolve_segment(segment: &PathSegment) -> Option<usize> {
        match segment {
            PathSegment::Index(index) => Some(*index),
            PathSegment::Key(key) => key.parse().ok(),
        }
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl From<&str> for KeyPath {
    fn from(text: &str) -> Self {
        KeyPath::parse(text)
    }
}

impl From<&String> for KeyPath {
    fn from(text: &String) -> Self {
        KeyPath::parse(text)
    }
}

impl From<&KeyPath> for KeyPath {
    fn from(path: &KeyPath) -> Self {
        path.clone()
    }
}

impl serde::Serialize for KeyPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path = KeyPath::parse("/data/list/0");
        assert_eq!(path.len(), 3);
        assert_eq!(path.to_string(), "/data/list/0");
        assert_eq!(KeyPath::root().to_string(), "/");
    }

    #[test]
    fn test_builders() {
        let path = KeyPath::root().key("history").key("entries").index(2);
        assert_eq!(path.to_string(), "/history/entries/2");
        assert_eq!(path.parent().unwrap().to_string(), "/history/entries");
        assert_eq!(KeyPath::resolve_segment(path.last().unwrap()), Some(2));
    }

    #[test]
    fn test_numeric_key_resolves_as_index() {
        let path = KeyPath::parse("a/12");
        assert_eq!(KeyPath::resolve_segment(&path.segments()[1]), Some(12));
        assert_eq!(KeyPath::resolve_segment(&path.segments()[0]), None);
    }
}
