//! Print the tree of a file

use crate::util;
use anyhow::Result;
use std::path::Path;
use tessera_core::{Config, OpenMode};

pub fn run(file: &Path, config: &Config, depth: usize, breadth: usize) -> Result<()> {
    let doc = util::open_document(file, config, OpenMode::ReadOnly)?;
    util::print_warnings(doc.warnings());
    print!("{}", doc.describe(depth, breadth));
    Ok(())
}
