//! Versioned tag identifiers (`name-major.minor.patch`)

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Tag of the format's own array node
pub const NDARRAY_TAG: &str = "core/ndarray";
/// Tag of history log entries
pub const HISTORY_ENTRY_TAG: &str = "core/history_entry";
/// Schema declared on the document root when none is given
pub const DEFAULT_SCHEMA: &str = "core/tessera-1.0.0";

/// A `major.minor.patch` schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut next = |what: &str| -> Result<u32, String> {
            parts
                .next()
                .ok_or_else(|| format!("version '{}' is missing its {} part", s, what))?
                .parse()
                .map_err(|_| format!("version '{}' has a non-numeric {} part", s, what))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        if parts.next().is_some() {
            return Err(format!("version '{}' has too many parts", s));
        }
        Ok(Self { major, minor, patch })
    }
}

/// Inclusive range of versions a converter understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: Version,
    pub max: Version,
}

impl VersionRange {
    pub fn new(min: Version, max: Version) -> Self {
        Self { min, max }
    }

    /// Range containing exactly one version
    pub fn exactly(version: Version) -> Self {
        Self {
            min: version,
            max: version,
        }
    }

    /// True when `min` is above `max`
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn contains(&self, version: Version) -> bool {
        self.min <= version && version <= self.max
    }

    /// Width used to rank overlapping ranges; narrower is more specific
    pub(crate) fn span(&self) -> (u32, u32, u32) {
        let major = self.max.major.saturating_sub(self.min.major);
        if major > 0 {
            return (major, u32::MAX, u32::MAX);
        }
        let minor = self.max.minor.saturating_sub(self.min.minor);
        if minor > 0 {
            return (0, minor, u32::MAX);
        }
        (0, 0, self.max.patch.saturating_sub(self.min.patch))
    }

    pub(crate) fn cmp_specificity(&self, other: &Self) -> Ordering {
        self.span().cmp(&other.span())
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}

/// A parsed tag: name plus version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    pub name: String,
    pub version: Version,
}

impl Tag {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Split `name-x.y.z` at its last dash
    ///
    /// Returns `None` for tags without a parseable version suffix; such tags
    /// are kept as opaque nodes.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.strip_prefix('!').unwrap_or(text);
        let (name, version) = text.rsplit_once('-')?;
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            version: version.parse().ok()?,
        })
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}
