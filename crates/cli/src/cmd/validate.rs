//! Validate the tree and every block

use crate::util;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::Path;
use tessera_core::{Config, Document, OpenMode, OpenOptions};

pub fn run(file: &Path, config: &Config) -> Result<()> {
    let options = OpenOptions::new()
        .config(config.clone())
        .mode(OpenMode::ReadOnly)
        .validate(true);
    let doc = Document::open(file, &options).with_context(|| format!("Failed to validate {}", file.display()))?;
    util::print_warnings(doc.warnings());

    doc.verify_blocks()
        .with_context(|| format!("Block check failed for {}", file.display()))?;

    println!(
        "{} {} ({} blocks, {} warnings)",
        "✓".green(),
        file.display(),
        doc.block_count(),
        doc.warnings().len()
    );
    Ok(())
}
