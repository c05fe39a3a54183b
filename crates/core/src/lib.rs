//! Tessera: a self-describing hybrid text/binary container format
//!
//! This crate provides:
//! - The tree data model (shared containers, lazy arrays, tagged values)
//! - Content-checksummed blocks with pluggable compression
//! - A versioned tag registry for typed values
//! - The textual segment codec (anchors, aliases, tags)
//! - Container assembly with streaming, exploded and in-place writes
//! - The `Document` file handle with search, describe and validation

pub mod array;
pub mod block;
pub mod codec;
pub mod compression;
pub mod config;
pub mod container;
pub mod describe;
pub mod document;
pub mod error;
pub mod hash;
pub mod history;
pub mod node;
pub mod path;
pub mod registry;
pub mod search;
pub mod tag;
pub mod text;
pub mod validate;

// Re-exports
pub use array::{ArrayAccess, ArrayDesc, Buffer, ByteOrder, DType, NdArray};
pub use codec::Warning;
pub use compression::{Codec, CodecRegistry, Compression};
pub use config::Config;
pub use describe::Summary;
pub use document::{Document, OpenMode, OpenOptions, UpdateStrategy, WriteOptions};
pub use error::{Error, ErrorKind, Result};
pub use history::HistoryEntry;
pub use node::{CustomValue, Mapping, Node, NodeKind, Shared};
pub use path::{KeyPath, PathSegment};
pub use registry::{BlockResolver, BlockSource, Converter, TagRegistry};
pub use search::Search;
pub use tag::{Tag, Version, VersionRange};
pub use validate::{CoreValidator, Validator, Violation};
