//! BLAKE3 checksums for block payloads

use crate::error::{Error, Result};

/// A BLAKE3 checksum of a block's uncompressed data (32 bytes)
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Length of the checksum as stored in a block header
    pub const LEN: usize = 32;

    /// Create a checksum from raw bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the checksum as a byte slice
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form stored in the block index (first four bytes, little-endian)
    pub fn short(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(text: &str) -> Result<Self> {
        if text.len() != 64 {
            return Err(Error::Config(format!(
                "invalid checksum length: expected 64 characters, got {}",
                text.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(text, &mut bytes)
            .map_err(|e| Error::Config(format!("invalid checksum '{}': {}", text, e)))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Checksum bytes using BLAKE3
pub fn checksum(data: &[u8]) -> Checksum {
    let hash = blake3::hash(data);
    Checksum::from_bytes(*hash.as_bytes())
}

/// Checksum large payloads using the rayon-parallel hasher
///
/// Only worthwhile above a few hundred KiB; smaller inputs take the serial path.
pub fn checksum_large(data: &[u8]) -> Checksum {
    const PARALLEL_THRESHOLD: usize = 512 * 1024;

    if data.len() < PARALLEL_THRESHOLD {
        return checksum(data);
    }
    let mut hasher = blake3::Hasher::new();
    hasher.update_rayon(data);
    Checksum::from_bytes(*hasher.finalize().as_bytes())
}
