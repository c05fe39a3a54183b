//! Find nodes by key, tag or kind

use crate::util;
use anyhow::Result;
use owo_colors::OwoColorize;
use serde::Serialize;
use std::path::Path;
use tessera_core::{Config, NodeKind, OpenMode};

/// Filters from the command line
#[derive(Debug, Default)]
pub struct Filters {
    pub key: Option<String>,
    pub tag: Option<String>,
    pub kind: Option<String>,
    pub max_depth: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Hit {
    path: String,
    kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
}

pub fn run(file: &Path, config: &Config, filters: Filters, json: bool) -> Result<()> {
    let doc = util::open_document(file, config, OpenMode::ReadOnly)?;
    util::print_warnings(doc.warnings());

    let mut search = doc.search();
    if let Some(key) = filters.key {
        search = search.key(key);
    }
    if let Some(tag) = filters.tag {
        search = search.tag(tag);
    }
    if let Some(kind) = filters.kind {
        search = search.kind(util::parse_kind(&kind)?);
    }
    if let Some(depth) = filters.max_depth {
        search = search.max_depth(depth);
    }

    let hits: Vec<Hit> = search
        .iter()
        .map(|(path, node)| Hit {
            path: path.to_string(),
            kind: node.kind(),
            tag: node.tag(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }

    if hits.is_empty() {
        println!("{}", "No matches".dimmed());
        return Ok(());
    }
    for hit in &hits {
        match &hit.tag {
            Some(tag) => println!("{}  {} !{}", hit.path, hit.kind.dimmed(), tag.cyan()),
            None => println!("{}  {}", hit.path, hit.kind.dimmed()),
        }
    }
    Ok(())
}
