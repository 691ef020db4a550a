// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file and return the raw, unvalidated model.
///
/// This only performs TOML deserialization. Use [`load_and_validate`] to
/// get a graph that is ready to submit.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    let config: RawConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Load a configuration file and validate it.
///
/// - Reads TOML and applies defaults.
/// - Checks numeric settings and duration strings.
/// - Builds the [`Graph`](crate::dag::Graph) and runs submission validation
///   on it (unknown dependencies, slot references, schemas, cycles).
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    ConfigFile::try_from(load_from_path(path)?)
}

/// Parse and validate configuration held in memory.
pub fn parse_config(contents: &str) -> Result<ConfigFile> {
    let raw: RawConfigFile = toml::from_str(contents)?;
    ConfigFile::try_from(raw)
}

/// `Dagwire.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Dagwire.toml")
}
