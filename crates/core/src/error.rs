//! Error kinds for reading and writing Tessera files
//!
//! Every variant carries the key path or byte offset at fault so callers can
//! point at the offending part of the file.

use crate::validate::Violation;
use std::fmt;

/// Errors produced by `tessera-core`
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The leading header lines are missing or unrecognized
    #[error("malformed header at byte {offset}: {reason}")]
    MalformedHeader { offset: u64, reason: String },

    /// The textual segment could not be parsed
    #[error("parse error at line {line}, column {column} (byte {offset}): {message}")]
    TextSegmentParse {
        line: usize,
        column: usize,
        offset: u64,
        message: String,
    },

    /// A container contains itself
    #[error("cyclic reference at {path}")]
    CyclicReference { path: String },

    /// A value cannot be represented in the textual segment
    #[error("unserializable value at {path}: {reason}")]
    UnserializableType { path: String, reason: String },

    /// No converter is registered for a tag (recoverable on decode)
    #[error("unknown tag '{tag}' at {path}")]
    UnknownTag { tag: String, path: String },

    /// The compression algorithm has no registered codec
    #[error("compression '{algorithm}' is not supported")]
    CompressionUnsupported { algorithm: String },

    /// A block is truncated or its checksum does not match
    #[error("block {index} at byte {offset} failed integrity check: {reason}")]
    BlockIntegrity {
        index: usize,
        offset: u64,
        reason: String,
    },

    /// The tree does not conform to its declared schema
    #[error("validation against '{schema}' failed with {} violation(s): {}", .violations.len(), summarize(.violations))]
    Validation {
        schema: String,
        violations: Vec<Violation>,
    },

    /// Mutation attempted on a read-only tree or array
    #[error("read-only violation: cannot modify {target}")]
    ReadOnlyViolation { target: String },

    /// A converter rejected a node or value
    #[error("converter for '{tag}' failed at {path}: {reason}")]
    Converter {
        tag: String,
        path: String,
        reason: String,
    },

    /// A key path does not address a valid location
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// A write was aborted before completion
    #[error("write aborted after {blocks_written} block(s)")]
    Aborted { blocks_written: usize },

    /// Configuration could not be loaded
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Coarse classification of an [`Error`], used for CLI reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorKind {
    MalformedHeader,
    TextSegmentParseError,
    CyclicReferenceError,
    UnserializableType,
    UnknownTag,
    CompressionUnsupported,
    BlockIntegrityError,
    ValidationError,
    ReadOnlyViolation,
    ConverterError,
    InvalidPath,
    Aborted,
    ConfigError,
    IoError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedHeader { .. } => ErrorKind::MalformedHeader,
            Error::TextSegmentParse { .. } => ErrorKind::TextSegmentParseError,
            Error::CyclicReference { .. } => ErrorKind::CyclicReferenceError,
            Error::UnserializableType { .. } => ErrorKind::UnserializableType,
            Error::UnknownTag { .. } => ErrorKind::UnknownTag,
            Error::CompressionUnsupported { .. } => ErrorKind::CompressionUnsupported,
            Error::BlockIntegrity { .. } => ErrorKind::BlockIntegrityError,
            Error::Validation { .. } => ErrorKind::ValidationError,
            Error::ReadOnlyViolation { .. } => ErrorKind::ReadOnlyViolation,
            Error::Converter { .. } => ErrorKind::ConverterError,
            Error::InvalidPath { .. } => ErrorKind::InvalidPath,
            Error::Aborted { .. } => ErrorKind::Aborted,
            Error::Config(_) => ErrorKind::ConfigError,
            Error::Io(_) => ErrorKind::IoError,
        }
    }

    pub(crate) fn integrity(index: usize, offset: u64, reason: impl Into<String>) -> Self {
        Error::BlockIntegrity {
            index,
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn read_only(target: impl Into<String>) -> Self {
        Error::ReadOnlyViolation {
            target: target.into(),
        }
    }
}

/// Result type used throughout tessera-core
pub type Result<T> = std::result::Result<T, Error>;
