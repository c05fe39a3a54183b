//! Tessera CLI - tsr command

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;
mod settings;
mod util;

/// Tessera - inspect and rewrite hybrid text/binary container files
#[derive(Parser)]
#[command(name = "tsr")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// TOML config file (TESSERA_* environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a file and print its tree
    Open {
        file: PathBuf,
        /// Levels of the tree to print
        #[arg(long, default_value = "3")]
        depth: usize,
        /// Children to print per container
        #[arg(long, default_value = "10")]
        breadth: usize,
    },
    /// Show format version, schema, blocks and history
    Info {
        file: PathBuf,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Find nodes by key, tag or kind
    Search {
        file: PathBuf,
        /// Substring of the last key segment
        #[arg(long)]
        key: Option<String>,
        /// Tag with or without version (e.g. core/ndarray)
        #[arg(long)]
        tag: Option<String>,
        /// Node kind (mapping, sequence, ndarray, str, int, ...)
        #[arg(long)]
        kind: Option<String>,
        /// Deepest level to descend to
        #[arg(long)]
        max_depth: Option<usize>,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Print the textual segment as stored
    Extract { file: PathBuf },
    /// Write every block to its own file next to a text-only main file
    Explode {
        file: PathBuf,
        /// Main output file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Gather external blocks back into a single file
    Implode {
        file: PathBuf,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Rewrite a file compactly, optionally recompressing every block
    Defragment {
        file: PathBuf,
        /// Output file (default: rewrite in place)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Compression for all blocks (none, zlib, zstd)
        #[arg(long)]
        compression: Option<String>,
    },
    /// Validate the tree and check every block checksum
    Validate { file: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error[{}]: {:#}", util::error_kind(&err), err);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config = settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Open { file, depth, breadth } => cmd::open::run(&file, &config, depth, breadth),
        Commands::Info { file, json } => cmd::info::run(&file, &config, json),
        Commands::Search { file, key, tag, kind, max_depth, json } => {
            let filters = cmd::search::Filters { key, tag, kind, max_depth };
            cmd::search::run(&file, &config, filters, json)
        }
        Commands::Extract { file } => cmd::extract::run(&file, &config),
        Commands::Explode { file, output } => cmd::explode::run(&file, &output, &config),
        Commands::Implode { file, output } => cmd::implode::run(&file, &output, &config),
        Commands::Defragment { file, output, compression } => {
            cmd::defragment::run(&file, output.as_deref(), compression.as_deref(), &config)
        }
        Commands::Validate { file } => cmd::validate::run(&file, &config),
    }
}
