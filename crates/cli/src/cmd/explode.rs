//! Split a file into a text-only main file and one file per block

use crate::util;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::Path;
use tessera_core::{Config, OpenMode, WriteOptions};

pub fn run(file: &Path, output: &Path, config: &Config) -> Result<()> {
    let doc = util::open_document(file, config, OpenMode::ReadOnly)?;
    let blocks = doc.block_count();
    doc.write_exploded(output, &WriteOptions::new())
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "{} {} ({} block files)",
        "Exploded".green().bold(),
        output.display(),
        blocks.to_string().yellow()
    );
    Ok(())
}
