//! Show format version, schema, block count and history

use crate::util;
use anyhow::Result;
use owo_colors::OwoColorize;
use serde::Serialize;
use std::path::Path;
use tessera_core::{Config, OpenMode, Summary, Warning};

/// File information structure
#[derive(Debug, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub format_version: String,
    pub schema: String,
    pub blocks: usize,
    pub history: Vec<HistoryLine>,
    pub warnings: Vec<Warning>,
    pub tree: Summary,
}

#[derive(Debug, Serialize)]
pub struct HistoryLine {
    pub description: String,
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,
}

pub fn run(file: &Path, config: &Config, json: bool) -> Result<()> {
    let doc = util::open_document(file, config, OpenMode::ReadOnly)?;

    let info = FileInfo {
        path: file.display().to_string(),
        size: std::fs::metadata(file)?.len(),
        format_version: doc.format_version().to_string(),
        schema: doc.schema().to_string(),
        blocks: doc.block_count(),
        history: doc
            .history()
            .into_iter()
            .map(|entry| HistoryLine {
                description: entry.description,
                time: entry.time.to_rfc3339(),
                software: entry.software.map(|s| format!("{} {}", s.name, s.version)),
            })
            .collect(),
        warnings: doc.warnings().to_vec(),
        tree: doc.describe(2, 20),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        display_info(&info);
    }
    Ok(())
}

fn display_info(info: &FileInfo) {
    println!("{}", "File Information".bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    println!("Path:            {}", info.path.cyan());
    println!("Size:            {}", util::format_size(info.size));
    println!("Format version:  {}", info.format_version);
    println!("Schema:          !{}", info.schema);
    println!("Blocks:          {}", info.blocks.to_string().yellow());
    println!();

    if info.history.is_empty() {
        println!("{}", "No history entries".dimmed());
    } else {
        println!("{}", "History".bold());
        for entry in &info.history {
            print!("  {} {}", entry.time.dimmed(), entry.description);
            match &entry.software {
                Some(software) => println!(" ({})", software.dimmed()),
                None => println!(),
            }
        }
    }
    println!();

    if !info.warnings.is_empty() {
        println!("{}", "Warnings".yellow().bold());
        for warning in &info.warnings {
            println!("  {}", warning);
        }
        println!();
    }

    print!("{}", info.tree);
}
