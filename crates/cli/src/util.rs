//! Shared helpers for CLI commands

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::Path;
use tessera_core::{Config, Document, NodeKind, OpenMode, OpenOptions, Warning};

/// Open `path` with the CLI's effective config
pub fn open_document(path: &Path, config: &Config, mode: OpenMode) -> Result<Document> {
    let options = OpenOptions::new().config(config.clone()).mode(mode);
    Document::open(path, &options).with_context(|| format!("Failed to open {}", path.display()))
}

/// Kind name printed in `error[<kind>]`
pub fn error_kind(err: &anyhow::Error) -> String {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<tessera_core::Error>())
        .map(|e| e.kind().to_string())
        .unwrap_or_else(|| "Error".to_string())
}

/// Parse a node kind as printed by `info` and `search`
pub fn parse_kind(name: &str) -> Result<NodeKind> {
    const KINDS: [NodeKind; 10] = [
        NodeKind::Null,
        NodeKind::Bool,
        NodeKind::Int,
        NodeKind::Float,
        NodeKind::Str,
        NodeKind::Sequence,
        NodeKind::Mapping,
        NodeKind::Array,
        NodeKind::Tagged,
        NodeKind::Custom,
    ];
    let wanted = name.trim().to_ascii_lowercase();
    KINDS
        .into_iter()
        .find(|kind| kind.name() == wanted || (wanted == "array" && *kind == NodeKind::Array))
        .with_context(|| format!("Unknown node kind '{}'", name))
}

/// Print decode warnings to stderr
pub fn print_warnings(warnings: &[Warning]) {
    for warning in warnings {
        eprintln!("{} {}", "warning:".yellow().bold(), warning);
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_parse_kind() -> Result<()> {
        assert_eq!(parse_kind("Mapping")?, NodeKind::Mapping);
        assert_eq!(parse_kind("ndarray")?, NodeKind::Array);
        assert_eq!(parse_kind("array")?, NodeKind::Array);
        assert!(parse_kind("matrix").is_err());
        Ok(())
    }

    #[test]
    fn test_error_kind_through_context() {
        let err = anyhow::Error::from(tessera_core::Error::Config("bad".into())).context("Failed to load");
        assert_eq!(error_kind(&err), "ConfigError");
        assert_eq!(error_kind(&anyhow::anyhow!("plain")), "Error");
    }
}
