//! Tag registry: versioned tags -> converters
//!
//! Converters translate between typed values and plain nodes. Several
//! converters may serve one tag name with different version ranges; resolution
//! picks one deterministically:
//!
//! 1. Converters whose range contains the requested version. The narrowest
//!    range wins, then the most recently registered.
//! 2. Otherwise tolerant converters (accepting additive fields) for the same
//!    major version whose range ends below the requested version. The highest
//!    `max` wins, then the narrowest range, then the most recent.
//! 3. Otherwise the tag is unknown.

use crate::array::Buffer;
use crate::error::{Error, Result};
use crate::node::{CustomValue, Node};
use crate::tag::{Tag, Version, VersionRange};
use std::fmt;
use std::sync::Arc;

/// Where an array's bytes come from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockSource {
    /// Block index within the same file
    Internal(usize),
    /// Relative name of a separate single-block file
    External(String),
}

impl fmt::Display for BlockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockSource::Internal(index) => write!(f, "{}", index),
            BlockSource::External(name) => f.write_str(name),
        }
    }
}

/// Binds block sources to lazy buffers during decode
pub trait BlockResolver {
    fn resolve(&self, source: &BlockSource) -> Result<Arc<Buffer>>;
}

/// Translates one tag's nodes to and from typed values
pub trait Converter: Send + Sync {
    /// Tag name without version, e.g. `core/history_entry`
    fn tag(&self) -> &str;

    /// Versions of the tag's schema this converter understands
    fn versions(&self) -> VersionRange;

    /// Whether newer minor versions with additive fields can be read
    fn tolerant(&self) -> bool {
        false
    }

    /// Produce the payload node; any arrays inside become blocks
    fn to_node(&self, value: &dyn CustomValue) -> Result<Node>;

    /// Rebuild a typed value; arrays in `node` are already lazy handles
    fn from_node(
        &self,
        node: &Node,
        version: Version,
        blocks: &dyn BlockResolver,
    ) -> Result<Arc<dyn CustomValue>>;
}

/// Lookup table of converters
#[derive(Clone, Default)]
pub struct TagRegistry {
    converters: Vec<Arc<dyn Converter>>,
}

impl TagRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in converters
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert(Arc::new(crate::history::HistoryEntryConverter));
        registry
    }

    /// Add a converter; its version range must not be empty
    pub fn register(&mut self, converter: Arc<dyn Converter>) -> Result<()> {
        let versions = converter.versions();
        if versions.is_empty() {
            return Err(Error::Converter {
                tag: converter.tag().to_string(),
                path: String::new(),
                reason: format!("empty version range {}", versions),
            });
        }
        self.insert(converter);
        Ok(())
    }

    fn insert(&mut self, converter: Arc<dyn Converter>) {
        tracing::debug!(
            tag = converter.tag(),
            versions = %converter.versions(),
            tolerant = converter.tolerant(),
            "registered converter"
        );
        self.converters.push(converter);
    }

    pub fn len(&self) -> usize {
        self.converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    /// Converter for reading `tag`
    pub fn resolve(&self, tag: &Tag) -> Result<Arc<dyn Converter>> {
        let candidates = || {
            self.converters
                .iter()
                .enumerate()
                .filter(|(_, c)| c.tag() == tag.name)
        };

        let exact = candidates()
            .filter(|(_, c)| c.versions().contains(tag.version))
            .min_by(|(ia, a), (ib, b)| {
                a.versions()
                    .cmp_specificity(&b.versions())
                    .then_with(|| ib.cmp(ia))
            });
        if let Some((_, converter)) = exact {
            return Ok(Arc::clone(converter));
        }

        let tolerant = candidates()
            .filter(|(_, c)| {
                let range = c.versions();
                c.tolerant() && range.max.major == tag.version.major && range.max < tag.version
            })
            .min_by(|(ia, a), (ib, b)| {
                b.versions()
                    .max
                    .cmp(&a.versions().max)
                    .then_with(|| a.versions().cmp_specificity(&b.versions()))
                    .then_with(|| ib.cmp(ia))
            });
        if let Some((_, converter)) = tolerant {
            tracing::debug!(
                tag = %tag,
                using = %converter.versions(),
                "reading newer tag version with tolerant converter"
            );
            return Ok(Arc::clone(converter));
        }

        Err(Error::UnknownTag {
            tag: tag.to_string(),
            path: String::new(),
        })
    }

    /// Converter used to write values of tag `name`: the newest version
    pub fn for_write(&self, name: &str) -> Option<Arc<dyn Converter>> {
        self.converters
            .iter()
            .enumerate()
            .filter(|(_, c)| c.tag() == name)
            .max_by(|(ia, a), (ib, b)| a.versions().max.cmp(&b.versions().max).then_with(|| ia.cmp(ib)))
            .map(|(_, c)| Arc::clone(c))
    }

    /// Registered `(tag, versions)` pairs, in registration order
    pub fn tags(&self) -> Vec<(String, VersionRange)> {
        self.converters
            .iter()
            .map(|c| (c.tag().to_string(), c.versions()))
            .collect()
    }
}

impl fmt::Debug for TagRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.converters.iter().map(|c| format!("{} {}", c.tag(), c.versions())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    #[derive(Debug, PartialEq)]
    struct Marker(&'static str);

    impl CustomValue for Marker {
        fn tag(&self) -> &str {
            "test/marker"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn dyn_eq(&self, other: &dyn CustomValue) -> bool {
            other.as_any().downcast_ref::<Self>() == Some(self)
        }
    }

    struct MarkerConverter {
        label: &'static str,
        range: VersionRange,
        tolerant: bool,
    }

    impl Converter for MarkerConverter {
        fn tag(&self) -> &str {
            "test/marker"
        }

        fn versions(&self) -> VersionRange {
            self.range
        }

        fn tolerant(&self) -> bool {
            self.tolerant
        }

        fn to_node(&self, _value: &dyn CustomValue) -> Result<Node> {
            Ok(Node::Str(self.label.to_string()))
        }

        fn from_node(&self, _node: &Node, _version: Version, _blocks: &dyn BlockResolver) -> Result<Arc<dyn CustomValue>> {
            Ok(Arc::new(Marker(self.label)))
        }
    }

    fn converter(label: &'static str, min: (u32, u32), max: (u32, u32), tolerant: bool) -> Arc<dyn Converter> {
        Arc::new(MarkerConverter {
            label,
            range: VersionRange::new(Version::new(min.0, min.1, 0), Version::new(max.0, max.1, 0)),
            tolerant,
        })
    }

    fn label_of(registry: &TagRegistry, version: Version) -> Option<String> {
        let tag = Tag::new("test/marker", version);
        registry
            .resolve(&tag)
            .ok()
            .and_then(|c| c.to_node(&Marker("")).ok())
            .and_then(|n| n.as_str().map(str::to_string))
    }

    #[test]
    fn test_narrowest_range_wins() -> Result<()> {
        let mut registry = TagRegistry::new();
        registry.register(converter("wide", (1, 0), (1, 5), false))?;
        registry.register(converter("narrow", (1, 2), (1, 2), false))?;
        assert_eq!(label_of(&registry, Version::new(1, 2, 0)).as_deref(), Some("narrow"));
        assert_eq!(label_of(&registry, Version::new(1, 4, 0)).as_deref(), Some("wide"));
        Ok(())
    }

    #[test]
    fn test_latest_registration_breaks_ties() -> Result<()> {
        let mut registry = TagRegistry::new();
        registry.register(converter("first", (1, 0), (1, 1), false))?;
        registry.register(converter("second", (1, 0), (1, 1), false))?;
        assert_eq!(label_of(&registry, Version::new(1, 0, 0)).as_deref(), Some("second"));
        Ok(())
    }

    #[test]
    fn test_tolerant_converter_reads_newer_minor() -> Result<()> {
        let mut registry = TagRegistry::new();
        registry.register(converter("old", (1, 0), (1, 1), true))?;
        registry.register(converter("strict", (1, 0), (1, 2), false))?;
        assert_eq!(label_of(&registry, Version::new(1, 7, 0)).as_deref(), Some("old"));
        // A new major version is never tolerated
        assert_eq!(label_of(&registry, Version::new(2, 0, 0)), None);
        Ok(())
    }

    #[test]
    fn test_inverted_range_rejected() -> Result<()> {
        let mut registry = TagRegistry::new();
        let inverted = Arc::new(MarkerConverter {
            label: "inverted",
            range: VersionRange {
                min: Version::new(1, 5, 3),
                max: Version::new(1, 5, 2),
            },
            tolerant: true,
        });
        let err = registry.register(inverted).unwrap_err();
        assert!(matches!(err, Error::Converter { ref reason, .. } if reason.contains("1.5.3..=1.5.2")));
        assert!(registry.is_empty());

        registry.register(converter("valid", (1, 0), (1, 5), false))?;
        assert_eq!(label_of(&registry, Version::new(1, 5, 0)).as_deref(), Some("valid"));
        Ok(())
    }

    #[test]
    fn test_unknown_tag() {
        let registry = TagRegistry::with_builtins();
        let err = registry
            .resolve(&Tag::new("acme/unknown", Version::new(1, 0, 0)))
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownTag { .. }));
    }

    #[test]
    fn test_for_write_picks_newest() -> Result<()> {
        let mut registry = TagRegistry::new();
        registry.register(converter("v1", (1, 0), (1, 0), false))?;
        registry.register(converter("v2", (2, 0), (2, 1), false))?;
        let chosen = registry.for_write("test/marker").unwrap();
        assert_eq!(chosen.versions().max, Version::new(2, 1, 0));
        assert!(registry.for_write("test/other").is_none());
        Ok(())
    }
}
