// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::dag::Graph;
use crate::engine::RuntimeOptions;
use crate::types::ClosePolicy;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// name = "nightly"
///
/// [scheduler]
/// parallelism = 2
/// cancel_timeout = "5s"
/// close_policy = "await_consumers"
/// state_dir = ".dagwire/state"
///
/// [retry]
/// max_retries = 2
/// first_backoff = "100ms"
///
/// [task.extract]
/// cmd = "cat data.csv"
/// outputs = [{ name = "rows" }]
///
/// [task.load]
/// cmd = "wc -l"
/// inputs = [{ name = "rows", from = "extract.rows" }]
/// ```
///
/// Everything except the tasks has a default. Use
/// [`ConfigFile::try_from`] to validate and build the graph.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    /// Graph name, used as the resource id for submit permission checks.
    #[serde(default = "default_graph_name")]
    pub name: String,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// Task attempt retries.
    #[serde(default)]
    pub retry: RetrySection,

    /// Retries of `ResourceUnavailable` allocation answers.
    #[serde(default)]
    pub allocation: RetrySection,

    /// All tasks from `[task.<id>]`, keyed by task id.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

fn default_graph_name() -> String {
    "dagwire".to_string()
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Duration string, e.g. `"5s"`.
    #[serde(default = "default_cancel_timeout")]
    pub cancel_timeout: String,

    #[serde(default)]
    pub close_policy: ClosePolicy,

    /// Size of the local worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Provisioning pools the local allocator accepts.
    #[serde(default = "default_pools")]
    pub pools: Vec<String>,

    /// Persist execution records here; in-memory when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// File-backed snapshot storage root; in-memory when unset.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
}

fn default_parallelism() -> usize {
    4
}

fn default_cancel_timeout() -> String {
    "5s".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_pools() -> Vec<String> {
    vec!["local".to_string()]
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            cancel_timeout: default_cancel_timeout(),
            close_policy: ClosePolicy::default(),
            workers: default_workers(),
            pools: default_pools(),
            state_dir: None,
            storage_dir: None,
        }
    }
}

/// `[retry]` and `[allocation]` sections.
///
/// `max_retries` is optional so each section can pick its own default
/// (2 for tasks, 3 for allocation).
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default = "default_first_backoff")]
    pub first_backoff: String,

    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,

    #[serde(default = "default_factor")]
    pub factor: f64,
}

fn default_first_backoff() -> String {
    "100ms".to_string()
}

fn default_max_backoff() -> String {
    "10s".to_string()
}

fn default_factor() -> f64 {
    2.0
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: None,
            first_backoff: default_first_backoff(),
            max_backoff: default_max_backoff(),
            factor: default_factor(),
        }
    }
}

/// `[task.<id>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// Shell command run by the worker.
    pub cmd: String,

    /// Ordering-only dependencies. Inputs add their producers implicitly.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default = "default_pool")]
    pub pool: String,

    #[serde(default = "default_cpu")]
    pub cpu: u32,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub outputs: Vec<OutputConfig>,

    #[serde(default)]
    pub inputs: Vec<InputConfig>,
}

fn default_pool() -> String {
    "local".to_string()
}

fn default_cpu() -> u32 {
    1
}

fn default_memory_mb() -> u64 {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    #[serde(default)]
    pub schema: Option<String>,
    /// Commit through storage instead of streaming.
    #[serde(default)]
    pub snapshot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    pub name: String,
    #[serde(default)]
    pub schema: Option<String>,
    /// `"<task>.<slot>"`.
    pub from: String,
}

/// Validated configuration.
///
/// Only constructed through `TryFrom<RawConfigFile>`, so holding one means
/// the graph passed submission validation.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub graph: Graph,
    pub options: RuntimeOptions,
    pub close_policy: ClosePolicy,
    pub workers: usize,
    pub pools: Vec<String>,
    pub state_dir: Option<PathBuf>,
    pub storage_dir: Option<PathBuf>,
}
