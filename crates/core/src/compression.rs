//! Block compression codecs
//!
//! Each block header records a one-byte algorithm id. Ids `0..=2` are the
//! built-in codecs; custom codecs register under `0x80..=0xfe`.

use crate::error::{Error, Result};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::sync::Arc;

/// Compression algorithm requested for a block
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    #[default]
    None,
    Zlib,
    Zstd,
    /// A codec registered by name in a [`CodecRegistry`]
    Custom(String),
}

impl Compression {
    pub fn name(&self) -> &str {
        match self {
            Compression::None => "none",
            Compression::Zlib => "zlib",
            Compression::Zstd => "zstd",
            Compression::Custom(name) => name,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Compression::None)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compression {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "raw" => Compression::None,
            "zlib" | "deflate" => Compression::Zlib,
            "zstd" => Compression::Zstd,
            other => Compression::Custom(other.to_string()),
        })
    }
}

impl serde::Serialize for Compression {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> serde::Deserialize<'de> for Compression {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(name.parse().unwrap_or_default())
    }
}

/// A stateless, reentrant block codec
pub trait Codec: Send + Sync {
    /// Algorithm name as used in configuration
    fn name(&self) -> &str;

    /// Algorithm id stored in block headers
    fn id(&self) -> u8;

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    /// Decompress `data`; `expected_len` is the uncompressed size from the header
    ///
    /// `expected_len` comes from the file and is not trusted: implementations
    /// must not produce more than `expected_len + 1` bytes nor allocate for
    /// it up front.
    fn decompress(&self, data: &[u8], expected_len: usize) -> io::Result<Vec<u8>>;
}

struct Identity;

impl Codec for Identity {
    fn name(&self) -> &str {
        "none"
    }

    fn id(&self) -> u8 {
        0
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _expected_len: usize) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

struct Zlib;

impl Codec for Zlib {
    fn name(&self) -> &str {
        "zlib"
    }

    fn id(&self) -> u8 {
        1
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::with_capacity(data.len() / 2), flate2::Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> io::Result<Vec<u8>> {
        read_bounded(flate2::read::ZlibDecoder::new(data), expected_len)
    }
}

struct Zstd;

impl Codec for Zstd {
    fn name(&self) -> &str {
        "zstd"
    }

    fn id(&self) -> u8 {
        2
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        zstd::bulk::compress(data, 3)
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> io::Result<Vec<u8>> {
        read_bounded(zstd::stream::read::Decoder::new(data)?, expected_len)
    }
}

/// Largest up-front allocation for a decompressed block
const PREALLOC_LIMIT: usize = 16 * 1024 * 1024;

/// Drain `reader`, stopping one byte past `expected_len`
///
/// A stream longer than declared comes back one byte long, which the caller
/// reports as a length mismatch.
pub fn read_bounded<R: Read>(reader: R, expected_len: usize) -> io::Result<Vec<u8>> {
    let limit = (expected_len as u64).saturating_add(1);
    let mut out = Vec::with_capacity(expected_len.min(PREALLOC_LIMIT));
    reader.take(limit).read_to_end(&mut out)?;
    Ok(out)
}

/// Lookup table of codecs by name and header id
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Lowest id available to custom codecs
    pub const CUSTOM_ID_MIN: u8 = 0x80;
    /// Highest id available to custom codecs
    pub const CUSTOM_ID_MAX: u8 = 0xfe;

    /// Registry with the built-in codecs (`none`, `zlib`, `zstd`)
    pub fn new() -> Self {
        Self {
            codecs: vec![Arc::new(Identity), Arc::new(Zlib), Arc::new(Zstd)],
        }
    }

    /// Register a custom codec
    ///
    /// Fails if the id is outside the custom range or already taken.
    pub fn register(&mut self, codec: Arc<dyn Codec>) -> Result<()> {
        let id = codec.id();
        if !(Self::CUSTOM_ID_MIN..=Self::CUSTOM_ID_MAX).contains(&id) {
            return Err(Error::Config(format!(
                "codec '{}' uses reserved id {:#04x}",
                codec.name(),
                id
            )));
        }
        if self.codecs.iter().any(|c| c.id() == id || c.name() == codec.name()) {
            return Err(Error::Config(format!(
                "codec '{}' (id {:#04x}) conflicts with a registered codec",
                codec.name(),
                id
            )));
        }
        self.codecs.push(codec);
        Ok(())
    }

    /// Resolve a codec for writing
    pub fn by_compression(&self, compression: &Compression) -> Result<Arc<dyn Codec>> {
        self.codecs
            .iter()
            .find(|c| c.name() == compression.name())
            .cloned()
            .ok_or_else(|| Error::CompressionUnsupported {
                algorithm: compression.name().to_string(),
            })
    }

    /// Resolve a codec from a block header id
    pub fn by_id(&self, id: u8) -> Result<Arc<dyn Codec>> {
        self.codecs
            .iter()
            .find(|c| c.id() == id)
            .cloned()
            .ok_or_else(|| Error::CompressionUnsupported {
                algorithm: format!("id {:#04x}", id),
            })
    }

    /// Map a header id back to a [`Compression`] value
    pub fn compression_for_id(&self, id: u8) -> Result<Compression> {
        let codec = self.by_id(id)?;
        Ok(codec.name().parse().unwrap_or_default())
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.codecs.iter().map(|c| (c.name().to_string(), c.id())))
            .finish()
    }
}
