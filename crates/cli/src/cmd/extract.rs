//! Dump the textual segment without decoding it

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use tessera_core::container::{open_backing, read_layout, read_text};
use tessera_core::Config;

pub fn run(file: &Path, config: &Config) -> Result<()> {
    let backing = open_backing(file, config.mmap, false)
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let layout = read_layout(&backing)?;
    let text = read_text(&backing, &layout)?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes()).context("Failed to write to stdout")?;
    Ok(())
}
