//! End-to-end tests for the tsr binary

mod common;

use anyhow::Result;
use common::{corrupt_block, write_sample};
use std::fs;
use tempfile::TempDir;
use tessera_core::{Document, Node, OpenOptions};

#[test]
fn test_open_prints_tree() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_sample(&temp_dir.path().join("sample.tsr"))?;

    let result = tsr!(temp_dir.path(), "open", "sample.tsr").assert_success()?;
    assert!(result.stdout.starts_with("root (mapping, "));
    assert!(result.contains_stdout("name: m31"));
    assert!(result.contains_stdout("data !core/ndarray-1.0.0 (int64 [2, 2] little)"));
    Ok(())
}

#[test]
fn test_info_json() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_sample(&temp_dir.path().join("sample.tsr"))?;

    let result = tsr!(temp_dir.path(), "info", "sample.tsr", "--json").assert_success()?;
    let info: serde_json::Value = serde_json::from_str(&result.stdout)?;
    assert_eq!(info["format_version"], "1.0.0");
    assert_eq!(info["schema"], "core/tessera-1.0.0");
    assert_eq!(info["blocks"], 2);
    assert_eq!(info["history"][0]["description"], "created sample");
    assert_eq!(info["tree"]["key"], "root");
    Ok(())
}

#[test]
fn test_info_text() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_sample(&temp_dir.path().join("sample.tsr"))?;

    let result = tsr!(temp_dir.path(), "info", "sample.tsr").assert_success()?;
    assert!(result.contains_stdout("Format version:  1.0.0"));
    assert!(result.contains_stdout("created sample"));
    Ok(())
}

#[test]
fn test_search_filters() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_sample(&temp_dir.path().join("sample.tsr"))?;

    let result = tsr!(temp_dir.path(), "search", "sample.tsr", "--tag", "core/ndarray", "--json").assert_success()?;
    let hits: Vec<serde_json::Value> = serde_json::from_str(&result.stdout)?;
    let paths: Vec<&str> = hits.iter().filter_map(|h| h["path"].as_str()).collect();
    assert_eq!(paths, vec!["/data", "/noise"]);

    let result = tsr!(temp_dir.path(), "search", "sample.tsr", "--key", "gain").assert_success()?;
    assert_eq!(result.stdout.lines().count(), 1);
    assert!(result.stdout.starts_with("/meta/gain "));
    assert!(result.contains_stdout("float"));

    let result = tsr!(temp_dir.path(), "search", "sample.tsr", "--kind", "matrix").assert_failure()?;
    assert!(result.contains_stderr("Unknown node kind"));
    Ok(())
}

#[test]
fn test_extract_dumps_text() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_sample(&temp_dir.path().join("sample.tsr"))?;

    let result = tsr!(temp_dir.path(), "extract", "sample.tsr").assert_success()?;
    assert!(result.stdout.starts_with("--- !core/tessera-1.0.0\n"));
    assert!(result.contains_stdout("!core/ndarray-1.0.0"));
    assert!(result.stdout.trim_end().ends_with("..."));
    Ok(())
}

#[test]
fn test_explode_then_implode() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let dir = temp_dir.path();
    write_sample(&dir.join("sample.tsr"))?;

    let result = tsr!(dir, "explode", "sample.tsr", "--output", "parts.tsr").assert_success()?;
    assert!(result.contains_stdout("block files"));
    assert!(dir.join("parts0000.tsr").exists());
    assert!(dir.join("parts0001.tsr").exists());

    tsr!(dir, "implode", "parts.tsr", "--output", "whole.tsr").assert_success()?;
    assert_eq!(fs::read(dir.join("whole.tsr"))?, fs::read(dir.join("sample.tsr"))?);
    Ok(())
}

#[test]
fn test_defragment_recompresses_in_place() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("sample.tsr");
    write_sample(&path)?;

    let result = tsr!(temp_dir.path(), "defragment", "sample.tsr", "--compression", "zstd").assert_success()?;
    assert!(result.contains_stdout("Defragment complete"));

    let doc = Document::open(&path, &OpenOptions::new())?;
    let data = doc.get("data").and_then(|n| n.as_array().cloned()).expect("data array");
    assert_eq!(data.get(&[1, 0])?, Node::Int(3));
    Ok(())
}

#[test]
fn test_defragment_unknown_compression() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_sample(&temp_dir.path().join("sample.tsr"))?;
    let original = fs::read(temp_dir.path().join("sample.tsr"))?;

    let result = tsr!(temp_dir.path(), "defragment", "sample.tsr", "--compression", "lzma").assert_failure()?;
    assert_eq!(result.error_kind(), Some("CompressionUnsupported"));
    assert_eq!(fs::read(temp_dir.path().join("sample.tsr"))?, original);
    Ok(())
}

#[test]
fn test_validate_reports_corrupt_block() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("sample.tsr");
    write_sample(&path)?;

    let result = tsr!(temp_dir.path(), "validate", "sample.tsr").assert_success()?;
    assert!(result.contains_stdout("2 blocks"));

    corrupt_block(&path, 1)?;
    let result = tsr!(temp_dir.path(), "validate", "sample.tsr").assert_failure()?;
    assert_eq!(result.error_kind(), Some("BlockIntegrityError"));

    // Opening only reads the text, so the damage goes unnoticed
    tsr!(temp_dir.path(), "open", "sample.tsr").assert_success()?;
    Ok(())
}

#[test]
fn test_malformed_header() -> Result<()> {
    let temp_dir = TempDir::new()?;
    fs::write(temp_dir.path().join("bad.tsr"), b"#NOT A TESSERA FILE\n")?;

    let result = tsr!(temp_dir.path(), "info", "bad.tsr").assert_failure()?;
    assert_eq!(result.error_kind(), Some("MalformedHeader"));
    Ok(())
}

#[test]
fn test_config_layers() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_sample(&temp_dir.path().join("sample.tsr"))?;
    fs::write(temp_dir.path().join("tessera.toml"), "mmap = false\n")?;

    tsr!(temp_dir.path(), "--config", "tessera.toml", "open", "sample.tsr").assert_success()?;

    let result = tsr!(temp_dir.path(), "open", "sample.tsr")
        .env("TESSERA_MMAP", "sometimes")
        .assert_failure()?;
    assert_eq!(result.error_kind(), Some("ConfigError"));

    let result = tsr!(temp_dir.path(), "--config", "missing.toml", "open", "sample.tsr").assert_failure()?;
    assert_eq!(result.error_kind(), Some("ConfigError"));
    Ok(())
}
