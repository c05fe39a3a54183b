//! Sample files for CLI tests

use anyhow::Result;
use std::fs;
use std::path::Path;
use tessera_core::block::{Backing, BlockHeader};
use tessera_core::container::read_layout;
use tessera_core::{Compression, Document, NdArray, WriteOptions};

/// Write a document with two arrays, a shared mapping and one history entry
pub fn write_sample(path: &Path) -> Result<()> {
    let mut doc = Document::new();
    doc.set("meta/name", "m31")?;
    doc.set("meta/gain", 2.5)?;
    doc.set("data", NdArray::from_i64(&[2, 2], &[1, 2, 3, 4])?)?;
    doc.set("noise", NdArray::from_f64(&[3], &[0.5, 0.25, 0.125])?)?;
    doc.set_compression("noise", Compression::Zlib)?;
    doc.append_history("created sample")?;
    doc.write(path, &WriteOptions::default())?;
    Ok(())
}

/// Flip the first payload byte of block `index`
pub fn corrupt_block(path: &Path, index: usize) -> Result<()> {
    let mut bytes = fs::read(path)?;
    let layout = read_layout(&Backing::Memory(bytes.clone().into()))?;
    let offset = layout.blocks[index].offset as usize + BlockHeader::ENCODED_LEN;
    bytes[offset] ^= 0xff;
    fs::write(path, &bytes)?;
    Ok(())
}
