// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `dagwire`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dagwire",
    version,
    about = "Run a task graph whose tasks exchange data over channels.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Dagwire.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DAGWIRE_LOG` or `info` is used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Validate the config and print the execution plan without running it.
    #[arg(long)]
    pub dry_run: bool,

    /// Resume unfinished executions from `[scheduler].state_dir` instead of
    /// submitting a new one.
    #[arg(long)]
    pub resume: bool,

    /// Override `[scheduler].parallelism`.
    #[arg(long, value_name = "N")]
    pub parallelism: Option<usize>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Filter directive understood by `EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = CliArgs::try_parse_from(["dagwire"]).unwrap();
        assert_eq!(args.config, "Dagwire.toml");
        assert!(!args.dry_run);
        assert!(!args.resume);
        assert_eq!(args.parallelism, None);
    }

    #[test]
    fn overrides() {
        let args = CliArgs::try_parse_from([
            "dagwire",
            "--config",
            "pipe.toml",
            "--log-level",
            "debug",
            "--parallelism",
            "8",
            "--resume",
        ])
        .unwrap();
        assert_eq!(args.config, "pipe.toml");
        assert_eq!(args.log_level, Some(LogLevel::Debug));
        assert_eq!(args.parallelism, Some(8));
        assert!(args.resume);
    }
}
