//! Gather the blocks of an exploded file back into one file

use crate::util;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::Path;
use tessera_core::{Config, OpenMode, WriteOptions};

pub fn run(file: &Path, output: &Path, config: &Config) -> Result<()> {
    let mut doc = util::open_document(file, config, OpenMode::ReadOnly)?;
    util::print_warnings(doc.warnings());
    doc.write(output, &WriteOptions::new())
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let size = std::fs::metadata(output)?.len();
    println!(
        "{} {} ({})",
        "Imploded".green().bold(),
        output.display(),
        util::format_size(size).dimmed()
    );
    Ok(())
}
