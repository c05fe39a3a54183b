//! Layered CLI configuration
//!
//! Precedence (highest to lowest):
//! 1. `TESSERA_*` environment variables
//! 2. The `--config` TOML file
//! 3. Library defaults

use anyhow::{Context, Result};
use config::{Environment, File, FileFormat};
use std::path::Path;
use tessera_core::Config;

/// Build the library config from the optional file and the environment
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(tessera_core::Error::Config(format!("config file not found: {}", path.display())).into());
        }
        builder = builder.add_source(File::from(path).format(FileFormat::Toml));
    }

    builder = builder.add_source(Environment::with_prefix("TESSERA").try_parsing(true));

    let layered = builder
        .build()
        .map_err(|e| tessera_core::Error::Config(e.to_string()))
        .context("Failed to read configuration")?;
    let config: Config = layered
        .try_deserialize()
        .map_err(|e| tessera_core::Error::Config(e.to_string()))
        .context("Invalid configuration")?;

    tracing::debug!(?config, "effective config");
    Ok(config)
}
