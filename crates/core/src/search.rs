//! Tree search
//!
//! A [`Search`] is a reusable query; each call to [`Search::iter`] starts a
//! fresh lazy depth-first walk. Shared containers are visited at every path
//! that reaches them; a container already on the current path is yielded but
//! not expanded again, so walks always end.

use crate::node::{Node, NodeKind};
use crate::path::{KeyPath, PathSegment};
use crate::tag::Tag;
use std::fmt;
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&Node) -> bool + Send + Sync>;

/// Query over a tree: every filter set must match
#[derive(Clone)]
pub struct Search {
    root: Node,
    key: Option<String>,
    tag: Option<String>,
    kind: Option<NodeKind>,
    predicate: Option<Predicate>,
    max_depth: Option<usize>,
}

impl Search {
    pub fn new(root: Node) -> Self {
        Self {
            root,
            key: None,
            tag: None,
            kind: None,
            predicate: None,
            max_depth: None,
        }
    }

    /// Match nodes whose key contains `substring`
    pub fn key(mut self, substring: impl Into<String>) -> Self {
        self.key = Some(substring.into());
        self
    }

    /// Match nodes carrying `tag`, given with or without its version
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into().trim_start_matches('!').to_string());
        self
    }

    pub fn kind(mut self, kind: NodeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Match nodes for which `predicate` returns true
    pub fn filter(mut self, predicate: impl Fn(&Node) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Do not descend below `depth` levels (the root is depth 0)
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn iter(&self) -> SearchIter<'_> {
        SearchIter {
            search: self,
            stack: vec![(KeyPath::root(), self.root.clone())],
            ancestors: Vec::new(),
        }
    }

    fn matches(&self, path: &KeyPath, node: &Node) -> bool {
        if let Some(key) = &self.key {
            match path.last() {
                Some(PathSegment::Key(k)) if k.contains(key.as_str()) => {}
                _ => return false,
            }
        }
        if let Some(kind) = self.kind {
            if node.kind() != kind {
                return false;
            }
        }
        if let Some(wanted) = &self.tag {
            let Some(tag) = node.tag() else {
                return false;
            };
            let name_matches = Tag::parse(&tag).is_some_and(|t| &t.name == wanted);
            if &tag != wanted && !name_matches {
                return false;
            }
        }
        match &self.predicate {
            Some(predicate) => predicate(node),
            None => true,
        }
    }
}

impl fmt::Debug for Search {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Search")
            .field("key", &self.key)
            .field("tag", &self.tag)
            .field("kind", &self.kind)
            .field("predicate", &self.predicate.is_some())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

/// Lazy depth-first walk yielding `(path, node)` matches
pub struct SearchIter<'a> {
    search: &'a Search,
    stack: Vec<(KeyPath, Node)>,
    /// Identities of the containers above the node being visited
    ancestors: Vec<Option<usize>>,
}

impl SearchIter<'_> {
    fn push_children(&mut self, path: &KeyPath, node: &Node) {
        if self.search.max_depth.is_some_and(|max| path.len() >= max) {
            return;
        }
        let container = match node {
            Node::Tagged(tagged) => &tagged.node,
            other => other,
        };
        // Depth-first order: the last nodes visited above this depth are its ancestors
        self.ancestors.truncate(path.len());
        let id = container.identity();
        if id.is_some() && self.ancestors.contains(&id) {
            return;
        }
        self.ancestors.push(id);
        // Children are pushed in reverse so they pop in document order
        match container {
            Node::Mapping(mapping) => {
                let mapping = mapping.read();
                let entries: Vec<_> = mapping.iter().collect();
                for (key, value) in entries.into_iter().rev() {
                    self.stack.push((path.key(key), value.clone()));
                }
            }
            Node::Sequence(items) => {
                for (i, item) in items.read().iter().enumerate().rev() {
                    self.stack.push((path.index(i), item.clone()));
                }
            }
            _ => {}
        }
    }
}

impl Iterator for SearchIter<'_> {
    type Item = (KeyPath, Node);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((path, node)) = self.stack.pop() {
            self.push_children(&path, &node);
            if self.search.matches(&path, &node) {
                return Some((path, node));
            }
        }
        None
    }
}
