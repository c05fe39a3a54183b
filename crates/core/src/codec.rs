//! Conversion between the user tree and the raw tagged tree
//!
//! Encoding turns arrays into `core/ndarray` nodes backed by blocks and custom
//! values into tagged payloads through the registry. Decoding reverses that,
//! binding arrays to lazy buffers. Both directions memoize on node identity so
//! shared containers stay shared.

use crate::array::{ArrayDesc, ByteOrder, DType, NdArray};
use crate::block::{BlockStore, Payload};
use crate::compression::Compression;
use crate::error::{Error, ErrorKind, Result};
use crate::node::{Mapping, Node, Shared, TaggedNode};
use crate::path::{KeyPath, PathSegment};
use crate::registry::{BlockResolver, BlockSource, TagRegistry};
use crate::tag::{Tag, Version, NDARRAY_TAG};
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;

/// Version of `core/ndarray` this library reads and writes
pub const NDARRAY_VERSION: Version = Version::new(1, 0, 0);

/// Full tag text of arrays
pub fn ndarray_tag() -> String {
    format!("{}-{}", NDARRAY_TAG, NDARRAY_VERSION)
}

/// A recoverable problem found while decoding, localized to a key path
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Warning {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}: {}", self.kind, self.path, self.message)
    }
}

/// How encoded arrays name their block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceNaming {
    /// `source: <block index>`
    Internal,
    /// `source: <stem>NNNN.tsr`, one file per block
    Exploded { stem: String },
}

impl SourceNaming {
    fn source(&self, index: usize) -> Node {
        match self {
            SourceNaming::Internal => Node::Int(index as i64),
            SourceNaming::Exploded { stem } => Node::Str(exploded_name(stem, index)),
        }
    }
}

/// File name of block `index` in exploded form
pub fn exploded_name(stem: &str, index: usize) -> String {
    format!("{}{:04}.tsr", stem, index)
}

/// Settings for one encode pass
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    /// Arrays with fewer bytes than this are written inline as nested lists
    pub inline_threshold: usize,
    /// Compression for new buffers
    pub default_compression: Compression,
    /// Compression forced on every buffer without an explicit choice
    pub compression_override: Option<Compression>,
    pub naming: SourceNaming,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            inline_threshold: 0,
            default_compression: Compression::None,
            compression_override: None,
            naming: SourceNaming::Internal,
        }
    }
}

/// Turns a user tree into a raw tree, allocating blocks as it goes
pub struct Encoder<'a> {
    registry: &'a TagRegistry,
    blocks: &'a mut BlockStore,
    options: &'a EncodeOptions,
    memo: AHashMap<usize, Node>,
    in_progress: AHashSet<usize>,
}

impl<'a> Encoder<'a> {
    pub fn new(registry: &'a TagRegistry, blocks: &'a mut BlockStore, options: &'a EncodeOptions) -> Self {
        Self {
            registry,
            blocks,
            options,
            memo: AHashMap::new(),
            in_progress: AHashSet::new(),
        }
    }

    /// Encode `root`; the identity map lives as long as this encoder
    pub fn encode(&mut self, root: &Node) -> Result<Node> {
        self.node(root, &mut KeyPath::root())
    }

    fn node(&mut self, node: &Node, path: &mut KeyPath) -> Result<Node> {
        let Some(id) = node.identity() else {
            return Ok(node.clone());
        };
        if let Some(done) = self.memo.get(&id) {
            return Ok(done.clone());
        }
        if !self.in_progress.insert(id) {
            return Err(Error::CyclicReference {
                path: path.to_string(),
            });
        }
        let raw = match node {
            Node::Sequence(items) => {
                let items = items.read().clone();
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    path.push(PathSegment::Index(i));
                    out.push(self.node(item, path)?);
                    path.pop();
                }
                Node::Sequence(Shared::new(out))
            }
            Node::Mapping(mapping) => {
                let entries: Vec<(String, Node)> = mapping
                    .read()
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect();
                let mut out = Mapping::new();
                for (key, value) in entries {
                    path.push(PathSegment::Key(key.clone()));
                    let encoded = self.node(&value, path)?;
                    path.pop();
                    out.insert(key, encoded);
                }
                Node::Mapping(Shared::new(out))
            }
            Node::Tagged(tagged) => Node::Tagged(Arc::new(TaggedNode {
                tag: tagged.tag.clone(),
                node: self.node(&tagged.node, path)?,
            })),
            Node::Array(array) => self.array(array, path)?,
            Node::Custom(value) => {
                let converter = self.registry.for_write(value.tag()).ok_or_else(|| Error::UnserializableType {
                    path: path.to_string(),
                    reason: format!("no converter registered for tag '{}'", value.tag()),
                })?;
                let payload = converter.to_node(value.as_ref()).map_err(|e| locate(e, path))?;
                Node::Tagged(Arc::new(TaggedNode {
                    tag: format!("{}-{}", converter.tag(), converter.versions().max),
                    node: self.node(&payload, path)?,
                }))
            }
            _ => unreachable!("scalars have no identity"),
        };
        self.in_progress.remove(&id);
        self.memo.insert(id, raw.clone());
        Ok(raw)
    }

    fn array(&mut self, array: &NdArray, path: &KeyPath) -> Result<Node> {
        let desc = array.desc();
        let mut mapping = Mapping::new();
        if desc.nbytes() < self.options.inline_threshold {
            mapping.insert("data", array.to_nested()?);
        } else {
            let buffer = array.buffer();
            let compression = match buffer.explicit_compression() {
                Some(explicit) => explicit,
                None => match &self.options.compression_override {
                    Some(forced) => forced.clone(),
                    None => buffer.compression_or(&self.options.default_compression)?,
                },
            };
            let block = self
                .blocks
                .allocate_for(array.buffer_id(), compression, Payload::Buffer(Arc::clone(buffer)))
                .map_err(|e| locate(e, path))?;
            mapping.insert("source", self.options.naming.source(block.0));
        }
        mapping.insert("datatype", desc.dtype.name());
        mapping.insert("byteorder", desc.byteorder.name());
        mapping.insert("shape", Node::seq(desc.shape.iter().map(|d| Node::Int(*d as i64))));
        if !mapping.contains_key("data") {
            if desc.offset != 0 {
                mapping.insert("offset", Node::Int(desc.offset as i64));
            }
            if !desc.is_contiguous() {
                mapping.insert("strides", Node::seq(desc.strides.iter().map(|s| Node::Int(*s as i64))));
            }
        }
        Ok(Node::tagged(ndarray_tag(), mapping))
    }
}

/// Fill in the key path of errors raised without one
fn locate(error: Error, path: &KeyPath) -> Error {
    match error {
        Error::Converter { tag, path: p, reason } if p.is_empty() => Error::Converter {
            tag,
            path: path.to_string(),
            reason,
        },
        Error::UnknownTag { tag, path: p } if p.is_empty() => Error::UnknownTag {
            tag,
            path: path.to_string(),
        },
        Error::UnserializableType { path: p, reason } if !p.starts_with('/') => Error::UnserializableType {
            path: path.to_string(),
            reason: format!("{}: {}", p, reason),
        },
        other => other,
    }
}

/// Turns a raw tree into a user tree, collecting recoverable warnings
pub struct Decoder<'a> {
    registry: &'a TagRegistry,
    blocks: &'a dyn BlockResolver,
    memo: AHashMap<usize, Node>,
    warnings: Vec<Warning>,
}

impl<'a> Decoder<'a> {
    pub fn new(registry: &'a TagRegistry, blocks: &'a dyn BlockResolver) -> Self {
        Self {
            registry,
            blocks,
            memo: AHashMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Decode `root` and return it with the warnings collected along the way
    pub fn decode(mut self, root: &Node) -> Result<(Node, Vec<Warning>)> {
        let node = self.node(root, &mut KeyPath::root())?;
        for warning in &self.warnings {
            tracing::warn!(path = %warning.path, kind = %warning.kind, "{}", warning.message);
        }
        Ok((node, self.warnings))
    }

    fn node(&mut self, raw: &Node, path: &mut KeyPath) -> Result<Node> {
        let Some(id) = raw.identity() else {
            return Ok(raw.clone());
        };
        if let Some(done) = self.memo.get(&id) {
            return Ok(done.clone());
        }
        let node = match raw {
            Node::Sequence(items) => {
                let items = items.read().clone();
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    path.push(PathSegment::Index(i));
                    out.push(self.node(item, path)?);
                    path.pop();
                }
                Node::Sequence(Shared::new(out))
            }
            Node::Mapping(mapping) => {
                let entries: Vec<(String, Node)> = mapping
                    .read()
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect();
                let mut out = Mapping::new();
                for (key, value) in entries {
                    path.push(PathSegment::Key(key.clone()));
                    let decoded = self.node(&value, path)?;
                    path.pop();
                    out.insert(key, decoded);
                }
                Node::Mapping(Shared::new(out))
            }
            Node::Tagged(tagged) => self.tagged(&tagged.tag, &tagged.node, path)?,
            other => other.clone(),
        };
        self.memo.insert(id, node.clone());
        Ok(node)
    }

    fn tagged(&mut self, tag_text: &str, payload: &Node, path: &mut KeyPath) -> Result<Node> {
        let opaque = |payload: Node| Node::tagged(tag_text, payload);
        let Some(tag) = Tag::parse(tag_text) else {
            let payload = self.node(payload, path)?;
            self.warn(path, &Error::UnknownTag {
                tag: tag_text.to_string(),
                path: String::new(),
            });
            return Ok(opaque(payload));
        };

        if tag.name == NDARRAY_TAG {
            if tag.version.major != NDARRAY_VERSION.major {
                self.warn(path, &Error::UnknownTag {
                    tag: tag_text.to_string(),
                    path: String::new(),
                });
                return Ok(opaque(self.node(payload, path)?));
            }
            return match self.array(payload, path) {
                Ok(array) => Ok(Node::Array(array)),
                Err(e) => {
                    self.warn(path, &e);
                    Ok(opaque(self.node(payload, path)?))
                }
            };
        }

        let payload = self.node(payload, path)?;
        let converter = match self.registry.resolve(&tag) {
            Ok(converter) => converter,
            Err(e) => {
                self.warn(path, &e);
                return Ok(opaque(payload));
            }
        };
        match converter.from_node(&payload, tag.version, self.blocks) {
            Ok(value) => Ok(Node::Custom(value)),
            Err(e) => {
                self.warn(path, &e);
                Ok(opaque(payload))
            }
        }
    }

    fn warn(&mut self, path: &KeyPath, error: &Error) {
        let located = locate_ref(error, path);
        self.warnings.push(Warning {
            path: path.to_string(),
            kind: error.kind(),
            message: located.as_ref().unwrap_or(error).to_string(),
        });
    }

    fn array(&mut self, payload: &Node, path: &KeyPath) -> Result<NdArray> {
        let invalid = |reason: String| Error::Converter {
            tag: ndarray_tag(),
            path: path.to_string(),
            reason,
        };
        let mapping = payload
            .as_mapping()
            .ok_or_else(|| invalid("ndarray payload must be a mapping".into()))?
            .read();

        let dtype: DType = mapping
            .get("datatype")
            .and_then(Node::as_str)
            .ok_or_else(|| invalid("missing 'datatype'".into()))?
            .parse()
            .map_err(invalid)?;
        let byteorder: ByteOrder = match mapping.get("byteorder").and_then(Node::as_str) {
            Some(order) => order.parse().map_err(invalid)?,
            None => ByteOrder::Little,
        };
        let shape = usize_list(mapping.get("shape"))
            .ok_or_else(|| invalid("'shape' must be a list of non-negative integers".into()))?;

        if let Some(data) = mapping.get("data") {
            ArrayDesc::contiguous(dtype, &shape).check_bounds().map_err(invalid)?;
            return NdArray::from_nested(data, dtype, byteorder, &shape).map_err(|e| invalid(e.to_string()));
        }

        let source = match mapping.get("source") {
            Some(Node::Int(index)) if *index >= 0 => BlockSource::Internal(*index as usize),
            Some(Node::Str(name)) => BlockSource::External(name.clone()),
            _ => return Err(invalid("'source' must be a block index or file name".into())),
        };
        let offset = match mapping.get("offset") {
            None => 0,
            Some(Node::Int(offset)) if *offset >= 0 => *offset as usize,
            Some(_) => return Err(invalid("'offset' must be a non-negative integer".into())),
        };
        let strides = match mapping.get("strides") {
            None => ArrayDesc::c_strides(&shape, dtype.size()),
            Some(node) => {
                let strides = usize_list(Some(node))
                    .ok_or_else(|| invalid("'strides' must be a list of non-negative integers".into()))?;
                if strides.len() != shape.len() {
                    return Err(invalid(format!(
                        "{} strides for {} dimensions",
                        strides.len(),
                        shape.len()
                    )));
                }
                strides
            }
        };
        let desc = ArrayDesc {
            dtype,
            byteorder,
            shape,
            offset,
            strides,
        };
        desc.check_bounds().map_err(invalid)?;
        let buffer = self.blocks.resolve(&source)?;
        Ok(NdArray::new(desc, buffer))
    }
}

/// Copy of `error` with its empty key path filled in, if it has one
fn locate_ref(error: &Error, path: &KeyPath) -> Option<Error> {
    match error {
        Error::UnknownTag { tag, path: p } if p.is_empty() => Some(Error::UnknownTag {
            tag: tag.clone(),
            path: path.to_string(),
        }),
        Error::Converter { tag, path: p, reason } if p.is_empty() => Some(Error::Converter {
            tag: tag.clone(),
            path: path.to_string(),
            reason: reason.clone(),
        }),
        _ => None,
    }
}

fn usize_list(node: Option<&Node>) -> Option<Vec<usize>> {
    let items = node?.as_sequence()?.read();
    items
        .iter()
        .map(|item| item.as_i64().filter(|v| *v >= 0).map(|v| v as usize))
        .collect()
}
