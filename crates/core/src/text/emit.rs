//! Emitter for the textual segment
//!
//! Containers reached more than once get an anchor (`&id001`, `&id002`, ...)
//! assigned in first-emission order; later occurrences become aliases.

use super::scalar::{format_key, format_scalar};
use crate::error::{Error, Result};
use crate::node::Node;
use crate::path::{KeyPath, PathSegment};
use ahash::AHashMap;
use std::fmt::Write;

/// Emit `root` as a complete document, from `---` up to and including `...`
pub fn emit_document(root: &Node, schema: Option<&str>) -> Result<String> {
    let mut emitter = Emitter::new(root)?;
    emitter.out.push_str("---");
    if let Some(schema) = schema {
        let _ = write!(emitter.out, " !{}", schema);
    }
    let mut path = KeyPath::root();
    match root {
        Node::Mapping(m) if !m.read().is_empty() && !emitter.needs_anchor(root) => {
            emitter.out.push('\n');
            emitter.mapping_entries(root, 0, &mut path)?;
        }
        _ => emitter.value(root, 0, &mut path)?,
    }
    emitter.out.push_str("...\n");
    Ok(emitter.out)
}

struct Emitter {
    /// Occurrence count per container identity
    counts: AHashMap<usize, usize>,
    anchors: AHashMap<usize, String>,
    next_anchor: usize,
    out: String,
}

impl Emitter {
    fn new(root: &Node) -> Result<Self> {
        let mut emitter = Self {
            counts: AHashMap::new(),
            anchors: AHashMap::new(),
            next_anchor: 1,
            out: String::new(),
        };
        emitter.count(root, &mut KeyPath::root(), &mut Vec::new())?;
        Ok(emitter)
    }

    fn count(&mut self, node: &Node, path: &mut KeyPath, stack: &mut Vec<usize>) -> Result<()> {
        let Some(id) = node.identity() else {
            return Ok(());
        };
        if stack.contains(&id) {
            return Err(Error::CyclicReference {
                path: path.to_string(),
            });
        }
        let seen = self.counts.entry(id).or_insert(0);
        *seen += 1;
        if *seen > 1 {
            return Ok(());
        }
        stack.push(id);
        match node {
            Node::Sequence(s) => {
                for (i, item) in s.read().iter().enumerate() {
                    path.push(PathSegment::Index(i));
                    self.count(item, path, stack)?;
                    path.pop();
                }
            }
            Node::Mapping(m) => {
                for (key, value) in m.read().iter() {
                    path.push(PathSegment::Key(key.to_string()));
                    self.count(value, path, stack)?;
                    path.pop();
                }
            }
            Node::Tagged(t) => self.count(&t.node, path, stack)?,
            Node::Array(_) | Node::Custom(_) => {
                return Err(Error::UnserializableType {
                    path: path.to_string(),
                    reason: format!("{} must be converted before emitting", node.kind()),
                })
            }
            _ => {}
        }
        stack.pop();
        Ok(())
    }

    fn needs_anchor(&self, node: &Node) -> bool {
        node.identity()
            .and_then(|id| self.counts.get(&id))
            .is_some_and(|count| *count > 1)
    }

    fn anchor_for(&mut self, id: usize) -> String {
        let name = format!("id{:03}", self.next_anchor);
        self.next_anchor += 1;
        self.anchors.insert(id, name.clone());
        name
    }

    fn indent(&mut self, indent: usize) {
        self.out.extend(std::iter::repeat(' ').take(indent));
    }

    /// Write a value directly after `key:`, `-` or `---`, ending with a newline.
    /// Block children are written at `indent`.
    fn value(&mut self, node: &Node, indent: usize, path: &mut KeyPath) -> Result<()> {
        if let Some(name) = node.identity().and_then(|id| self.anchors.get(&id)) {
            let _ = writeln!(self.out, " *{}", name);
            return Ok(());
        }

        let (tag, content) = match node {
            Node::Tagged(t) => (Some(t.tag.as_str()), &t.node),
            _ => (None, node),
        };

        let mut anchor = None;
        if self.needs_anchor(node) {
            if let Some(id) = node.identity() {
                anchor = Some(self.anchor_for(id));
            }
        }
        if tag.is_some() && self.needs_anchor(content) {
            let content_id = content.identity().unwrap_or_default();
            if anchor.is_some() || self.anchors.contains_key(&content_id) {
                return Err(Error::UnserializableType {
                    path: path.to_string(),
                    reason: "tagged payload is shared independently of its tag".into(),
                });
            }
            anchor = Some(self.anchor_for(content_id));
        }

        if let Some(anchor) = &anchor {
            let _ = write!(self.out, " &{}", anchor);
        }
        if let Some(tag) = tag {
            let _ = write!(self.out, " !{}", tag);
        }

        if let Some(text) = format_scalar(content) {
            let _ = writeln!(self.out, " {}", text);
            return Ok(());
        }
        match content {
            Node::Mapping(m) if m.read().is_empty() => self.out.push_str(" {}\n"),
            Node::Sequence(s) if s.read().is_empty() => self.out.push_str(" []\n"),
            Node::Sequence(_) if self.is_flow(content, true) => {
                self.out.push(' ');
                self.flow(content);
                self.out.push('\n');
            }
            Node::Mapping(_) => {
                self.out.push('\n');
                self.mapping_entries(content, indent, path)?;
            }
            Node::Sequence(s) => {
                self.out.push('\n');
                let items = s.read().clone();
                for (i, item) in items.iter().enumerate() {
                    self.indent(indent);
                    self.out.push('-');
                    path.push(PathSegment::Index(i));
                    self.value(item, indent + 2, path)?;
                    path.pop();
                }
            }
            Node::Tagged(_) => {
                return Err(Error::UnserializableType {
                    path: path.to_string(),
                    reason: "a tagged node cannot directly carry another tag".into(),
                })
            }
            _ => {
                return Err(Error::UnserializableType {
                    path: path.to_string(),
                    reason: format!("{} must be converted before emitting", content.kind()),
                })
            }
        }
        Ok(())
    }

    fn mapping_entries(&mut self, node: &Node, indent: usize, path: &mut KeyPath) -> Result<()> {
        let Some(mapping) = node.as_mapping() else {
            return Ok(());
        };
        let entries: Vec<(String, Node)> = mapping
            .read()
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        for (key, value) in &entries {
            self.indent(indent);
            self.out.push_str(&format_key(key));
            self.out.push(':');
            path.push(PathSegment::Key(key.clone()));
            self.value(value, indent + 2, path)?;
            path.pop();
        }
        Ok(())
    }

    /// Sequences of scalars, or of unshared scalar sequences, are written inline
    fn is_flow(&self, node: &Node, outer: bool) -> bool {
        match node {
            Node::Sequence(s) => {
                if !outer && self.needs_anchor(node) {
                    return false;
                }
                s.read()
                    .iter()
                    .all(|item| item.is_scalar() || self.is_flow(item, false))
            }
            _ => false,
        }
    }

    fn flow(&mut self, node: &Node) {
        if let Some(text) = format_scalar(node) {
            self.out.push_str(&text);
            return;
        }
        if let Node::Sequence(s) = node {
            self.out.push('[');
            for (i, item) in s.read().iter().enumerate() {
                if i > 0 {
                    self.out.push_str(", ");
                }
                self.flow(item);
            }
            self.out.push(']');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_mapping() -> Result<()> {
        let root = Node::map([
            ("number", Node::Float(6.0)),
            ("list", Node::seq([1, 4, 9, 16])),
        ]);
        let text = emit_document(&root, Some("core/tessera-1.0.0"))?;
        assert_eq!(
            text,
            "--- !core/tessera-1.0.0\nnumber: 6.0\nlist: [1, 4, 9, 16]\n...\n"
        );
        Ok(())
    }

    #[test]
    fn test_shared_container_anchored_once() -> Result<()> {
        let shared = Node::map([("x", 1)]);
        let root = Node::map([("a", shared.clone()), ("b", shared)]);
        let text = emit_document(&root, None)?;
        assert_eq!(text, "---\na: &id001\n  x: 1\nb: *id001\n...\n");
        Ok(())
    }

    #[test]
    fn test_nested_block_structure() -> Result<()> {
        let root = Node::map([(
            "items",
            Node::seq([Node::map([("name", "a"), ("tags", "x")]), Node::Null]),
        )]);
        let text = emit_document(&root, None)?;
        assert_eq!(
            text,
            "---\nitems:\n  -\n    name: a\n    tags: x\n  - null\n...\n"
        );
        Ok(())
    }

    #[test]
    fn test_tagged_payload() -> Result<()> {
        let root = Node::map([("w", Node::tagged("acme/widget-1.2.0", Node::map([("n", 3)])))]);
        let text = emit_document(&root, None)?;
        assert_eq!(text, "---\nw: !acme/widget-1.2.0\n  n: 3\n...\n");
        Ok(())
    }

    #[test]
    fn test_cycle_detected() {
        let inner = Node::empty_map();
        let root = Node::map([("inner", inner.clone())]);
        inner.as_mapping().unwrap().write().unwrap().insert("back", root.clone());
        let err = emit_document(&root, None).unwrap_err();
        assert!(matches!(err, Error::CyclicReference { ref path } if path == "/inner/back"));
        // break the cycle so the test does not leak
        inner.as_mapping().unwrap().write().unwrap().remove("back");
    }

    #[test]
    fn test_empty_collections() -> Result<()> {
        let root = Node::map([("m", Node::empty_map()), ("s", Node::seq(Vec::<Node>::new()))]);
        assert_eq!(emit_document(&root, None)?, "---\nm: {}\ns: []\n...\n");
        assert_eq!(emit_document(&Node::empty_map(), None)?, "--- {}\n...\n");
        Ok(())
    }
}
