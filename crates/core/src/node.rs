//! The tree data model
//!
//! A tree is a closed set of node variants. Containers live behind
//! [`Shared`] handles, so two positions in the tree can hold the very same
//! container; that identity is what the codec turns into anchors and aliases.

use crate::array::NdArray;
use crate::error::{Error, Result};
use crate::tag::NDARRAY_TAG;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A shared, mutable container with pointer identity
///
/// A frozen container refuses writes through every handle.
pub struct Shared<T>(Arc<SharedCell<T>>);

struct SharedCell<T> {
    value: RwLock<T>,
    frozen: AtomicBool,
}

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(SharedCell {
            value: RwLock::new(value),
            frozen: AtomicBool::new(false),
        }))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.value.read()
    }

    /// Exclusive access; fails with `ReadOnlyViolation` once frozen
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, T>> {
        if self.is_frozen() {
            return Err(Error::read_only("frozen container"));
        }
        Ok(self.0.value.write())
    }

    /// Refuse further writes; returns false if already frozen
    pub fn freeze(&self) -> bool {
        !self.0.frozen.swap(true, Ordering::AcqRel)
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.load(Ordering::Acquire)
    }

    /// True if both handles refer to the same container
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address-based identity, stable while any handle is alive
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.read(), f)
    }
}

/// Insertion-ordered string-keyed map with unique keys
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    entries: Vec<(String, Node)>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace; a replaced key keeps its original position
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Node>) -> Option<Node> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Node> {
        let position = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(position).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl<K: Into<String>, V: Into<Node>> FromIterator<(K, V)> for Mapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut mapping = Mapping::new();
        for (k, v) in iter {
            mapping.insert(k, v);
        }
        mapping
    }
}

/// A node carrying an explicit tag that has not been resolved to a typed value
#[derive(Debug, Clone)]
pub struct TaggedNode {
    /// Full tag text, e.g. `acme/widget-1.2.0`
    pub tag: String,
    pub node: Node,
}

/// A typed value reconstructed by a registered converter
pub trait CustomValue: Any + Send + Sync + fmt::Debug {
    /// Tag name (without version) of the converter that writes this value
    fn tag(&self) -> &str;

    fn as_any(&self) -> &dyn Any;

    /// Structural equality against another custom value
    fn dyn_eq(&self, other: &dyn CustomValue) -> bool;
}

/// Discriminant of a [`Node`], used by search filters and summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum NodeKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    Sequence,
    Mapping,
    Array,
    Tagged,
    Custom,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Null => "null",
            NodeKind::Bool => "bool",
            NodeKind::Int => "int",
            NodeKind::Float => "float",
            NodeKind::Str => "str",
            NodeKind::Sequence => "sequence",
            NodeKind::Mapping => "mapping",
            NodeKind::Array => "ndarray",
            NodeKind::Tagged => "tagged",
            NodeKind::Custom => "custom",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value in the tree
#[derive(Clone)]
pub enum Node {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Sequence(Shared<Vec<Node>>),
    Mapping(Shared<Mapping>),
    Array(NdArray),
    Tagged(Arc<TaggedNode>),
    Custom(Arc<dyn CustomValue>),
}

impl Node {
    /// New sequence node
    pub fn seq(items: impl IntoIterator<Item = impl Into<Node>>) -> Self {
        Node::Sequence(Shared::new(items.into_iter().map(Into::into).collect()))
    }

    /// New mapping node
    pub fn map<K: Into<String>, V: Into<Node>>(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        Node::Mapping(Shared::new(entries.into_iter().collect()))
    }

    pub fn empty_map() -> Self {
        Node::Mapping(Shared::new(Mapping::new()))
    }

    pub fn tagged(tag: impl Into<String>, node: impl Into<Node>) -> Self {
        Node::Tagged(Arc::new(TaggedNode {
            tag: tag.into(),
            node: node.into(),
        }))
    }

    pub fn custom<T: CustomValue>(value: T) -> Self {
        Node::Custom(Arc::new(value))
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Null => NodeKind::Null,
            Node::Bool(_) => NodeKind::Bool,
            Node::Int(_) => NodeKind::Int,
            Node::Float(_) => NodeKind::Float,
            Node::Str(_) => NodeKind::Str,
            Node::Sequence(_) => NodeKind::Sequence,
            Node::Mapping(_) => NodeKind::Mapping,
            Node::Array(_) => NodeKind::Array,
            Node::Tagged(_) => NodeKind::Tagged,
            Node::Custom(_) => NodeKind::Custom,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Node::Null | Node::Bool(_) | Node::Int(_) | Node::Float(_) | Node::Str(_)
        )
    }

    /// Identity of reference-like nodes; scalars have none
    pub fn identity(&self) -> Option<usize> {
        match self {
            Node::Sequence(s) => Some(s.id()),
            Node::Mapping(m) => Some(m.id()),
            Node::Array(a) => Some(a.id()),
            Node::Tagged(t) => Some(Arc::as_ptr(t) as *const () as usize),
            Node::Custom(c) => Some(Arc::as_ptr(c) as *const () as usize),
            _ => None,
        }
    }

    /// True if both nodes are the same shared object
    pub fn ptr_eq(&self, other: &Node) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Declared tag, if the node has one
    pub fn tag(&self) -> Option<String> {
        match self {
            Node::Tagged(t) => Some(t.tag.clone()),
            Node::Array(_) => Some(format!("{}-1.0.0", NDARRAY_TAG)),
            Node::Custom(c) => Some(c.tag().to_string()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Node::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Node::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value widened to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Node::Float(f) => Some(*f),
            Node::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&Shared<Mapping>> {
        match self {
            Node::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&Shared<Vec<Node>>> {
        match self {
            Node::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Node::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_tagged(&self) -> Option<&TaggedNode> {
        match self {
            Node::Tagged(t) => Some(t),
            _ => None,
        }
    }

    /// Downcast a custom value to its concrete type
    pub fn downcast<T: CustomValue>(&self) -> Option<&T> {
        match self {
            Node::Custom(c) => c.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Child lookup by key (mappings) or index (sequences)
    pub fn child(&self, segment: &crate::path::PathSegment) -> Option<Node> {
        use crate::path::{KeyPath, PathSegment};
        match (self, segment) {
            (Node::Mapping(m), PathSegment::Key(key)) => m.read().get(key).cloned(),
            (Node::Sequence(s), segment) => {
                let index = KeyPath::resolve_segment(segment)?;
                s.read().get(index).cloned()
            }
            (Node::Tagged(t), _) => t.node.child(segment),
            _ => None,
        }
    }

    /// Freeze every container reachable from this node
    pub fn freeze(&self) {
        match self {
            Node::Sequence(s) => {
                if s.freeze() {
                    s.read().iter().for_each(Node::freeze);
                }
            }
            Node::Mapping(m) => {
                if m.freeze() {
                    m.read().iter().for_each(|(_, v)| v.freeze());
                }
            }
            Node::Tagged(t) => t.node.freeze(),
            _ => {}
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Null => f.write_str("Null"),
            Node::Bool(b) => write!(f, "Bool({})", b),
            Node::Int(i) => write!(f, "Int({})", i),
            Node::Float(x) => write!(f, "Float({:?})", x),
            Node::Str(s) => write!(f, "Str({:?})", s),
            Node::Sequence(s) => f.debug_tuple("Sequence").field(s).finish(),
            Node::Mapping(m) => f.debug_tuple("Mapping").field(m).finish(),
            Node::Array(a) => fmt::Debug::fmt(a, f),
            Node::Tagged(t) => f.debug_tuple("Tagged").field(&t.tag).field(&t.node).finish(),
            Node::Custom(c) => f.debug_tuple("Custom").field(c).finish(),
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match (self, other) {
            (Node::Null, Node::Null) => true,
            (Node::Bool(a), Node::Bool(b)) => a == b,
            (Node::Int(a), Node::Int(b)) => a == b,
            (Node::Float(a), Node::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Node::Str(a), Node::Str(b)) => a == b,
            (Node::Sequence(a), Node::Sequence(b)) => *a.read() == *b.read(),
            (Node::Mapping(a), Node::Mapping(b)) => {
                let (a, b) = (a.read(), b.read());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
            }
            (Node::Array(a), Node::Array(b)) => a == b,
            (Node::Tagged(a), Node::Tagged(b)) => a.tag == b.tag && a.node == b.node,
            (Node::Custom(a), Node::Custom(b)) => a.dyn_eq(b.as_ref()),
            _ => false,
        }
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Node::Bool(value)
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Node::Int(value)
    }
}

impl From<i32> for Node {
    fn from(value: i32) -> Self {
        Node::Int(value as i64)
    }
}

impl From<u32> for Node {
    fn from(value: u32) -> Self {
        Node::Int(value as i64)
    }
}

impl From<f64> for Node {
    fn from(value: f64) -> Self {
        Node::Float(value)
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Node::Str(value.to_string())
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Node::Str(value)
    }
}

impl From<Vec<Node>> for Node {
    fn from(value: Vec<Node>) -> Self {
        Node::Sequence(Shared::new(value))
    }
}

impl From<Mapping> for Node {
    fn from(value: Mapping) -> Self {
        Node::Mapping(Shared::new(value))
    }
}

impl From<NdArray> for Node {
    fn from(value: NdArray) -> Self {
        Node::Array(value)
    }
}

impl<T: Into<Node>> From<Option<T>> for Node {
    fn from(value: Option<T>) -> Self {
        value.map_or(Node::Null, Into::into)
    }
}
