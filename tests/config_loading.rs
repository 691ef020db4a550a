// tests/config_loading.rs

mod common;
use crate::common::{TestResult, init_tracing, with_timeout};

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use dagwire::cli::CliArgs;
use dagwire::config::load_and_validate;
use dagwire::errors::DagwireError;

const PIPELINE: &str = r#"
name = "lines"

[scheduler]
parallelism = 2
cancel_timeout = "1s"

[retry]
max_retries = 0

[task.produce]
cmd = "printf 'a\nb\nc\n'"
outputs = [{ name = "rows", schema = "text" }]

[task.count]
cmd = "wc -l"
inputs = [{ name = "rows", schema = "text", from = "produce.rows" }]
"#;

fn write_config(dir: &Path, contents: &str) -> String {
    let path = dir.join("Dagwire.toml");
    fs::write(&path, contents).expect("write config");
    path.to_string_lossy().into_owned()
}

fn args(config: String) -> CliArgs {
    CliArgs {
        config,
        log_level: None,
        dry_run: false,
        resume: false,
        parallelism: None,
    }
}

#[test]
fn config_file_loads_into_a_validated_graph() -> TestResult {
    let dir = TempDir::new()?;
    let cfg = load_and_validate(write_config(dir.path(), PIPELINE))?;

    assert_eq!(cfg.graph.name, "lines");
    assert_eq!(cfg.options.parallelism, 2);
    assert_eq!(cfg.options.retry.max_retries, 0);
    let count = cfg.graph.task("count").expect("count task");
    assert_eq!(count.inputs[0].from.task, "produce");
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let err = load_and_validate(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, DagwireError::IoError(_)));
}

#[test]
fn malformed_toml_is_a_toml_error() {
    let dir = TempDir::new().unwrap();
    let err = load_and_validate(write_config(dir.path(), "[task.A\ncmd = ")).unwrap_err();
    assert!(matches!(err, DagwireError::TomlError(_)));
}

#[tokio::test]
async fn dry_run_validates_without_running() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    let marker = dir.path().join("ran");
    let config = format!("[task.touch]\ncmd = \"touch {}\"\n", marker.to_string_lossy());

    let mut cli = args(write_config(dir.path(), &config));
    cli.dry_run = true;
    dagwire::run(cli).await?;

    assert!(!marker.exists());
    Ok(())
}

#[tokio::test]
async fn pipeline_of_shell_commands_runs_to_completion() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    let state_dir = dir.path().join("state");
    let config = PIPELINE.replace(
        "cancel_timeout = \"1s\"",
        &format!("cancel_timeout = \"1s\"\nstate_dir = \"{}\"", state_dir.to_string_lossy()),
    );

    with_timeout(dagwire::run(args(write_config(dir.path(), &config)))).await?;

    // One persisted record for the finished execution.
    let records = fs::read_dir(&state_dir)?.count();
    assert_eq!(records, 1);
    Ok(())
}

#[tokio::test]
async fn failing_command_makes_the_run_fail() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    let config = PIPELINE.replace("wc -l", "exit 3");

    let err = with_timeout(dagwire::run(args(write_config(dir.path(), &config))))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("did not complete"), "{err:#}");
    Ok(())
}

#[tokio::test]
async fn zero_parallelism_override_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut cli = args(write_config(dir.path(), PIPELINE));
    cli.parallelism = Some(0);
    assert!(dagwire::run(cli).await.is_err());
}
