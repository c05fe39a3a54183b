//! Structured summaries of a tree
//!
//! Arrays are described from their descriptor alone; their bytes are never
//! read.

use crate::node::{Node, NodeKind};
use crate::path::PathSegment;
use crate::text::format_scalar;
use serde::Serialize;
use std::fmt;

/// Longest scalar preview kept in a summary
const PREVIEW_LEN: usize = 40;

/// Shape and type of an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArraySummary {
    pub datatype: String,
    pub byteorder: String,
    pub shape: Vec<usize>,
}

/// One node of a summary tree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub key: String,
    /// Kind of the node, or of the payload for tagged nodes
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub array: Option<ArraySummary>,
    /// Number of children of a container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub len: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Summary>,
    /// Children left out by the breadth limit
    #[serde(skip_serializing_if = "is_zero")]
    pub hidden: usize,
    /// Children left out by the depth limit
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl Summary {
    /// Summarize `root` down to `depth_limit` levels, listing at most
    /// `breadth_limit` children per container
    pub fn of(root: &Node, depth_limit: usize, breadth_limit: usize) -> Self {
        build("root".to_string(), root, depth_limit, breadth_limit)
    }
}

fn build(key: String, node: &Node, depth: usize, breadth: usize) -> Summary {
    let mut summary = Summary {
        key,
        kind: node.kind(),
        tag: None,
        value: None,
        array: None,
        len: None,
        children: Vec::new(),
        hidden: 0,
        truncated: false,
    };
    let container = match node {
        Node::Tagged(tagged) => {
            summary.tag = Some(tagged.tag.clone());
            summary.kind = tagged.node.kind();
            &tagged.node
        }
        other => other,
    };
    match container {
        Node::Array(array) => {
            let desc = array.desc();
            summary.tag = node.tag();
            summary.array = Some(ArraySummary {
                datatype: desc.dtype.name().to_string(),
                byteorder: desc.byteorder.name().to_string(),
                shape: desc.shape.clone(),
            });
        }
        Node::Custom(value) => {
            summary.tag = Some(value.tag().to_string());
        }
        Node::Mapping(mapping) => {
            let children: Vec<(PathSegment, Node)> = mapping
                .read()
                .iter()
                .map(|(k, v)| (PathSegment::Key(k.to_string()), v.clone()))
                .collect();
            fill(&mut summary, children, depth, breadth);
        }
        Node::Sequence(items) => {
            let children: Vec<(PathSegment, Node)> = items
                .read()
                .iter()
                .enumerate()
                .map(|(i, v)| (PathSegment::Index(i), v.clone()))
                .collect();
            fill(&mut summary, children, depth, breadth);
        }
        scalar => {
            summary.value = format_scalar(scalar).map(|text| preview(&text));
        }
    }
    summary
}

fn fill(summary: &mut Summary, children: Vec<(PathSegment, Node)>, depth: usize, breadth: usize) {
    summary.len = Some(children.len());
    if children.is_empty() {
        return;
    }
    if depth == 0 {
        summary.truncated = true;
        return;
    }
    summary.hidden = children.len().saturating_sub(breadth);
    summary.children = children
        .into_iter()
        .take(breadth)
        .map(|(segment, child)| build(segment.to_string(), &child, depth - 1, breadth))
        .collect();
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_LEN {
        return text.to_string();
    }
    let cut: String = text.chars().take(PREVIEW_LEN - 3).collect();
    format!("{}...", cut)
}

impl Summary {
    fn label(&self) -> String {
        let mut label = self.key.clone();
        if let Some(value) = &self.value {
            return format!("{}: {}", label, value);
        }
        if let Some(tag) = &self.tag {
            label.push_str(&format!(" !{}", tag));
        }
        match (&self.array, self.len) {
            (Some(array), _) => {
                let shape: Vec<String> = array.shape.iter().map(|d| d.to_string()).collect();
                label.push_str(&format!(" ({} [{}] {})", array.datatype, shape.join(", "), array.byteorder));
            }
            (None, Some(len)) => {
                let noun = if len == 1 { "item" } else { "items" };
                label.push_str(&format!(" ({}, {} {})", self.kind, len, noun));
            }
            (None, None) => label.push_str(&format!(" ({})", self.kind)),
        }
        label
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, prefix: &str) -> fmt::Result {
        let total = self.children.len() + usize::from(self.hidden > 0) + usize::from(self.truncated);
        let mut drawn = 0;
        let mut branch = |f: &mut fmt::Formatter<'_>, text: &str| -> Result<bool, fmt::Error> {
            drawn += 1;
            let glyph = if drawn == total { "└── " } else { "├── " };
            writeln!(f, "{}{}{}", prefix, glyph, text)?;
            Ok(drawn == total)
        };
        for child in &self.children {
            let last = branch(f, &child.label())?;
            let nested = format!("{}{}", prefix, if last { "    " } else { "│   " });
            child.render(f, &nested)?;
        }
        if self.hidden > 0 {
            branch(f, &format!("... {} more", self.hidden))?;
        }
        if self.truncated {
            branch(f, "...")?;
        }
        Ok(())
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.label())?;
        self.render(f, "")
    }
}
