// src/config/mod.rs

//! Configuration loading and validation for dagwire.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Turn the raw model into a validated graph plus runtime options
//!   (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, parse_config};
pub use model::{ConfigFile, InputConfig, OutputConfig, RawConfigFile, RetrySection, SchedulerSection, TaskConfig};
