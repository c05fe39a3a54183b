//! Library settings passed explicitly to open and write

use crate::compression::Compression;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Defaults for opening and writing documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Compression for new array buffers (default: none)
    pub default_compression: Compression,

    /// Memory-map files on open (default: true)
    pub mmap: bool,

    /// Validate the tree on open (default: false)
    pub validate_on_open: bool,

    /// Arrays smaller than this many bytes are written inline (default: 0)
    pub inline_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_compression: Compression::None,
            mmap: true,
            validate_on_open: false,
            inline_threshold: 0,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a TOML file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), ?config, "loaded config");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() -> Result<()> {
        let config = Config::from_toml_str("default_compression = \"zstd\"\n")?;
        assert_eq!(config.default_compression, Compression::Zstd);
        assert!(config.mmap);
        assert!(!config.validate_on_open);
        Ok(())
    }

    #[test]
    fn test_load_and_roundtrip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("tessera.toml");
        let config = Config {
            default_compression: Compression::Zlib,
            mmap: false,
            validate_on_open: true,
            inline_threshold: 64,
        };
        std::fs::write(&path, config.to_toml_string()?)?;
        assert_eq!(Config::load(&path)?, config);
        Ok(())
    }

    #[test]
    fn test_bad_values_are_config_errors() {
        let err = Config::from_toml_str("mmap = \"sometimes\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = Config::from_toml_str("inline_threshold = -1").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unknown_compression_names_a_custom_codec() -> Result<()> {
        let config = Config::from_toml_str("default_compression = \"lzma\"")?;
        assert_eq!(config.default_compression, Compression::Custom("lzma".into()));
        Ok(())
    }
}
