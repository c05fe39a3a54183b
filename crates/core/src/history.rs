//! History log entries (`core/history_entry-1.0.0`)
//!
//! The log lives at `history/entries` in the tree and is append-only: the
//! document API only ever pushes new entries.

use crate::error::{Error, Result};
use crate::node::{CustomValue, Mapping, Node};
use crate::registry::{BlockResolver, Converter};
use crate::tag::{Version, VersionRange, HISTORY_ENTRY_TAG};
use chrono::{DateTime, SecondsFormat, Utc};
use std::any::Any;
use std::sync::Arc;

/// Software that produced an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Software {
    pub name: String,
    pub version: String,
}

impl Software {
    /// This library
    pub fn current() -> Self {
        Self {
            name: "tessera".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// One timestamped history record
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub description: String,
    pub time: DateTime<Utc>,
    pub software: Option<Software>,
}

impl HistoryEntry {
    /// Entry stamped with the current time and this library as software
    pub fn now(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            // Stored at second precision so entries survive a round-trip unchanged
            time: DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap_or_else(Utc::now),
            software: Some(Software::current()),
        }
    }
}

impl CustomValue for HistoryEntry {
    fn tag(&self) -> &str {
        HISTORY_ENTRY_TAG
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn CustomValue) -> bool {
        other.as_any().downcast_ref::<Self>() == Some(self)
    }
}

/// Built-in converter for history entries
pub struct HistoryEntryConverter;

impl HistoryEntryConverter {
    fn error(reason: impl Into<String>) -> Error {
        Error::Converter {
            tag: HISTORY_ENTRY_TAG.to_string(),
            path: String::new(),
            reason: reason.into(),
        }
    }
}

impl Converter for HistoryEntryConverter {
    fn tag(&self) -> &str {
        HISTORY_ENTRY_TAG
    }

    fn versions(&self) -> VersionRange {
        VersionRange::exactly(Version::new(1, 0, 0))
    }

    fn tolerant(&self) -> bool {
        true
    }

    fn to_node(&self, value: &dyn CustomValue) -> Result<Node> {
        let entry = value
            .as_any()
            .downcast_ref::<HistoryEntry>()
            .ok_or_else(|| Self::error("value is not a history entry"))?;
        let mut mapping = Mapping::new();
        mapping.insert("description", entry.description.as_str());
        mapping.insert("time", entry.time.to_rfc3339_opts(SecondsFormat::AutoSi, true));
        if let Some(software) = &entry.software {
            mapping.insert(
                "software",
                Node::map([
                    ("name", software.name.as_str()),
                    ("version", software.version.as_str()),
                ]),
            );
        }
        Ok(mapping.into())
    }

    fn from_node(&self, node: &Node, _version: Version, _blocks: &dyn BlockResolver) -> Result<Arc<dyn CustomValue>> {
        let mapping = node
            .as_mapping()
            .ok_or_else(|| Self::error("expected a mapping"))?
            .read();
        let description = mapping
            .get("description")
            .and_then(Node::as_str)
            .ok_or_else(|| Self::error("missing 'description'"))?
            .to_string();
        let time = mapping
            .get("time")
            .and_then(Node::as_str)
            .ok_or_else(|| Self::error("missing 'time'"))?;
        let time = DateTime::parse_from_rfc3339(time)
            .map_err(|e| Self::error(format!("bad time '{}': {}", time, e)))?
            .with_timezone(&Utc);
        let software = match mapping.get("software").and_then(Node::as_mapping) {
            Some(software) => {
                let software = software.read();
                let field = |key: &str| {
                    software
                        .get(key)
                        .and_then(Node::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| Self::error(format!("software is missing '{}'", key)))
                };
                Some(Software {
                    name: field("name")?,
                    version: field("version")?,
                })
            }
            None => None,
        };
        Ok(Arc::new(HistoryEntry {
            description,
            time,
            software,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Buffer;
    use crate::registry::BlockSource;

    struct NoBlocks;

    impl BlockResolver for NoBlocks {
        fn resolve(&self, source: &BlockSource) -> Result<Arc<Buffer>> {
            Err(Error::InvalidPath {
                path: source.to_string(),
                reason: "no blocks".into(),
            })
        }
    }

    #[test]
    fn test_entry_roundtrip() -> Result<()> {
        let entry = HistoryEntry::now("calibrated");
        let converter = HistoryEntryConverter;
        let node = converter.to_node(&entry)?;
        let back = converter.from_node(&node, Version::new(1, 0, 0), &NoBlocks)?;
        assert!(back.dyn_eq(&entry));
        Ok(())
    }

    #[test]
    fn test_extra_fields_ignored() -> Result<()> {
        let node = Node::map([
            ("description", Node::from("x")),
            ("time", Node::from("2024-01-03T14:30:00Z")),
            ("operator", Node::from("added in 1.1")),
        ]);
        let value = HistoryEntryConverter.from_node(&node, Version::new(1, 1, 0), &NoBlocks)?;
        let entry = value.as_any().downcast_ref::<HistoryEntry>().unwrap();
        assert_eq!(entry.description, "x");
        assert!(entry.software.is_none());
        Ok(())
    }

    #[test]
    fn test_missing_description_rejected() {
        let node = Node::map([("time", "2024-01-03T14:30:00Z")]);
        assert!(HistoryEntryConverter
            .from_node(&node, Version::new(1, 0, 0), &NoBlocks)
            .is_err());
    }
}
