//! Rewrite a file compactly, optionally with a new compression

use crate::util;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::Path;
use tessera_core::{Compression, Config, OpenMode, WriteOptions};

pub fn run(file: &Path, output: Option<&Path>, compression: Option<&str>, config: &Config) -> Result<()> {
    let before = std::fs::metadata(file)
        .with_context(|| format!("Failed to stat {}", file.display()))?
        .len();
    let target = output.unwrap_or(file);

    let mut options = WriteOptions::new();
    if let Some(name) = compression {
        let compression: Compression = name.parse().unwrap_or_default();
        options = options.compression(compression);
    }

    let mut doc = util::open_document(file, config, OpenMode::Read)?;
    util::print_warnings(doc.warnings());
    doc.write(target, &options)
        .with_context(|| format!("Failed to write {}", target.display()))?;
    let after = std::fs::metadata(target)?.len();

    println!("{}", "Defragment complete".green().bold());
    println!("Blocks:  {}", doc.block_count().to_string().yellow());
    println!("Before:  {}", util::format_size(before));
    println!("After:   {}", util::format_size(after).green());
    Ok(())
}
