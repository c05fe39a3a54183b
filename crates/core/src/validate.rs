//! Pluggable tree validation
//!
//! Schema rule definitions live outside this crate; anything implementing
//! [`Validator`] can be attached to open and write. [`CoreValidator`] checks
//! the structure of the format's own node types.

use crate::array::{ByteOrder, DType};
use crate::error::{Error, Result};
use crate::node::Node;
use crate::path::{KeyPath, PathSegment};
use crate::tag::{Tag, HISTORY_ENTRY_TAG, NDARRAY_TAG};
use ahash::AHashSet;
use std::fmt;

/// One rule a tree breaks
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl fmt::Display, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Checks a tree against the schema named on its root
pub trait Validator: Send + Sync {
    fn validate(&self, root: &Node, schema: &str) -> Vec<Violation>;
}

/// Run `validator` and turn violations into an error
pub fn check(validator: &dyn Validator, root: &Node, schema: &str) -> Result<()> {
    let violations = validator.validate(root, schema);
    if violations.is_empty() {
        Ok(())
    } else {
        tracing::debug!(schema, violations = violations.len(), "validation failed");
        Err(Error::Validation {
            schema: schema.to_string(),
            violations,
        })
    }
}

/// Structural checks for arrays, history entries and the history log
///
/// Accepts both raw trees (tagged payloads) and decoded trees.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreValidator;

impl Validator for CoreValidator {
    fn validate(&self, root: &Node, _schema: &str) -> Vec<Violation> {
        let mut walk = Walk::default();
        if root.as_mapping().is_none() {
            walk.violations.push(Violation::new("/", "root must be a mapping"));
            return walk.violations;
        }
        walk.node(root, &mut KeyPath::root());
        check_history_layout(root, &mut walk.violations);
        walk.violations
    }
}

#[derive(Default)]
struct Walk {
    seen: AHashSet<usize>,
    violations: Vec<Violation>,
}

impl Walk {
    fn node(&mut self, node: &Node, path: &mut KeyPath) {
        if let Some(id) = node.identity() {
            if !self.seen.insert(id) {
                return;
            }
        }
        match node {
            Node::Mapping(mapping) => {
                for (key, value) in mapping.read().iter() {
                    path.push(PathSegment::Key(key.to_string()));
                    self.node(value, path);
                    path.pop();
                }
            }
            Node::Sequence(items) => {
                for (i, item) in items.read().iter().enumerate() {
                    path.push(PathSegment::Index(i));
                    self.node(item, path);
                    path.pop();
                }
            }
            Node::Tagged(tagged) => {
                match Tag::parse(&tagged.tag) {
                    Some(tag) if tag.name == NDARRAY_TAG => check_ndarray(&tagged.node, path, &mut self.violations),
                    Some(tag) if tag.name == HISTORY_ENTRY_TAG => {
                        check_history_entry(&tagged.node, path, &mut self.violations)
                    }
                    _ => {}
                }
                self.node(&tagged.node, path);
            }
            Node::Array(array) => {
                let desc = array.desc();
                if desc.strides.len() != desc.shape.len() {
                    self.violations
                        .push(Violation::new(&*path, "array strides do not match its dimensions"));
                }
            }
            _ => {}
        }
    }
}

fn field<'a>(mapping: &'a crate::node::Mapping, key: &str) -> Option<&'a Node> {
    mapping.get(key)
}

fn is_count_list(node: Option<&Node>) -> bool {
    node.and_then(Node::as_sequence)
        .is_some_and(|items| items.read().iter().all(|n| n.as_i64().is_some_and(|v| v >= 0)))
}

fn check_ndarray(payload: &Node, path: &KeyPath, out: &mut Vec<Violation>) {
    let Some(mapping) = payload.as_mapping() else {
        out.push(Violation::new(path, "ndarray must be a mapping"));
        return;
    };
    let mapping = mapping.read();
    match field(&mapping, "datatype").and_then(Node::as_str) {
        Some(name) if name.parse::<DType>().is_ok() => {}
        Some(name) => out.push(Violation::new(path, format!("unknown datatype '{}'", name))),
        None => out.push(Violation::new(path, "ndarray requires 'datatype'")),
    }
    if let Some(order) = field(&mapping, "byteorder") {
        if order.as_str().and_then(|o| o.parse::<ByteOrder>().ok()).is_none() {
            out.push(Violation::new(path, "byteorder must be 'little' or 'big'"));
        }
    }
    if !is_count_list(field(&mapping, "shape")) {
        out.push(Violation::new(path, "shape must be a list of non-negative integers"));
    }
    match (field(&mapping, "source"), field(&mapping, "data")) {
        (Some(Node::Int(i)), None) if *i >= 0 => {}
        (Some(Node::Str(_)), None) => {}
        (None, Some(_)) => {}
        (Some(_), Some(_)) => out.push(Violation::new(path, "ndarray has both 'source' and 'data'")),
        (None, None) => out.push(Violation::new(path, "ndarray requires 'source' or 'data'")),
        (Some(_), None) => out.push(Violation::new(path, "source must be a block index or file name")),
    }
    if let Some(strides) = field(&mapping, "strides") {
        if !is_count_list(Some(strides)) {
            out.push(Violation::new(path, "strides must be a list of non-negative integers"));
        }
    }
}

fn check_history_entry(payload: &Node, path: &KeyPath, out: &mut Vec<Violation>) {
    let Some(mapping) = payload.as_mapping() else {
        out.push(Violation::new(path, "history entry must be a mapping"));
        return;
    };
    let mapping = mapping.read();
    if field(&mapping, "description").and_then(Node::as_str).is_none() {
        out.push(Violation::new(path, "history entry requires a 'description' string"));
    }
    match field(&mapping, "time").and_then(Node::as_str) {
        Some(time) if chrono::DateTime::parse_from_rfc3339(time).is_ok() => {}
        Some(time) => out.push(Violation::new(path, format!("time '{}' is not RFC 3339", time))),
        None => out.push(Violation::new(path, "history entry requires a 'time' string")),
    }
}

fn check_history_layout(root: &Node, out: &mut Vec<Violation>) {
    let Some(history) = root.as_mapping().and_then(|m| m.read().get("history").cloned()) else {
        return;
    };
    let Some(history) = history.as_mapping() else {
        out.push(Violation::new("/history", "history must be a mapping"));
        return;
    };
    let Some(entries) = history.read().get("entries").cloned() else {
        return;
    };
    let Some(entries) = entries.as_sequence() else {
        out.push(Violation::new("/history/entries", "history entries must be a sequence"));
        return;
    };
    for (i, entry) in entries.read().iter().enumerate() {
        let is_entry = match entry {
            Node::Custom(value) => value.tag() == HISTORY_ENTRY_TAG,
            Node::Tagged(tagged) => Tag::parse(&tagged.tag).is_some_and(|t| t.name == HISTORY_ENTRY_TAG),
            _ => false,
        };
        if !is_entry {
            out.push(Violation::new(
                format!("/history/entries/{}", i),
                format!("expected a {} node", HISTORY_ENTRY_TAG),
            ));
        }
    }
}
