// src/config/validate.rs

use std::time::Duration;

use crate::channel::DataSchema;
use crate::config::model::{ConfigFile, InputConfig, OutputConfig, RawConfigFile, RetrySection, TaskConfig};
use crate::dag::{ExecutionSpec, Graph, InputSlotSpec, OutputSlotSpec, SlotRef, TaskSpec, validate_graph};
use crate::engine::RuntimeOptions;
use crate::errors::{DagwireError, Result};
use crate::exec::ProvisioningSpec;
use crate::policy::{BackoffPolicy, RetryPolicy};
use crate::types::parse_duration;

const DEFAULT_TASK_RETRIES: u32 = 2;
const DEFAULT_ALLOCATION_RETRIES: u32 = 3;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = DagwireError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_tasks(&raw)?;
        validate_scheduler(&raw)?;

        let options = RuntimeOptions {
            parallelism: raw.scheduler.parallelism,
            retry: retry_policy("retry", &raw.retry, DEFAULT_TASK_RETRIES)?,
            allocation_retry: retry_policy("allocation", &raw.allocation, DEFAULT_ALLOCATION_RETRIES)?,
            cancel_timeout: duration("scheduler", "cancel_timeout", &raw.scheduler.cancel_timeout)?,
        };

        let graph = build_graph(&raw)?;
        validate_graph(&graph)?;

        Ok(ConfigFile {
            graph,
            options,
            close_policy: raw.scheduler.close_policy,
            workers: raw.scheduler.workers,
            pools: raw.scheduler.pools,
            state_dir: raw.scheduler.state_dir,
            storage_dir: raw.scheduler.storage_dir,
        })
    }
}

fn config_error(msg: impl Into<String>) -> DagwireError {
    DagwireError::ConfigError(msg.into())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(config_error(
            "config must contain at least one [task.<id>] section",
        ));
    }
    Ok(())
}

fn validate_scheduler(cfg: &RawConfigFile) -> Result<()> {
    let scheduler = &cfg.scheduler;
    if scheduler.parallelism == 0 {
        return Err(config_error("[scheduler].parallelism must be >= 1 (got 0)"));
    }
    if scheduler.workers == 0 {
        return Err(config_error("[scheduler].workers must be >= 1 (got 0)"));
    }
    if scheduler.pools.is_empty() {
        return Err(config_error("[scheduler].pools must name at least one pool"));
    }
    Ok(())
}

fn duration(section: &str, key: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| config_error(format!("[{section}].{key}: {e}")))
}

fn retry_policy(section: &str, raw: &RetrySection, default_retries: u32) -> Result<RetryPolicy> {
    if !raw.factor.is_finite() || raw.factor < 1.0 {
        return Err(config_error(format!(
            "[{section}].factor must be a finite number >= 1.0 (got {})",
            raw.factor
        )));
    }

    let backoff = BackoffPolicy {
        first: duration(section, "first_backoff", &raw.first_backoff)?,
        max: duration(section, "max_backoff", &raw.max_backoff)?,
        factor: raw.factor,
    };
    if backoff.first > backoff.max {
        return Err(config_error(format!(
            "[{section}].first_backoff must not exceed max_backoff"
        )));
    }

    Ok(RetryPolicy::new(raw.max_retries.unwrap_or(default_retries), backoff))
}

fn build_graph(cfg: &RawConfigFile) -> Result<Graph> {
    let mut graph = Graph::new(cfg.name.clone());
    for (id, task) in &cfg.task {
        graph = graph.with_task(task_spec(id, task)?);
    }
    Ok(graph)
}

fn task_spec(id: &str, task: &TaskConfig) -> Result<TaskSpec> {
    if task.cmd.trim().is_empty() {
        return Err(config_error(format!("task '{id}' has an empty `cmd`")));
    }

    let inputs = task
        .inputs
        .iter()
        .map(|input| input_spec(id, input))
        .collect::<Result<Vec<_>>>()?;

    Ok(TaskSpec {
        id: id.to_string(),
        exec: ExecutionSpec {
            cmd: task.cmd.clone(),
            provisioning: ProvisioningSpec {
                pool: task.pool.clone(),
                cpu: task.cpu,
                memory_mb: task.memory_mb,
                env: task.env.clone(),
            },
        },
        after: task.after.clone(),
        inputs,
        outputs: task.outputs.iter().map(output_spec).collect(),
    })
}

fn schema(name: &Option<String>) -> DataSchema {
    name.as_deref().map(DataSchema::new).unwrap_or_default()
}

fn input_spec(task: &str, input: &InputConfig) -> Result<InputSlotSpec> {
    let from: SlotRef = input
        .from
        .parse()
        .map_err(|e| config_error(format!("task '{task}' input '{}': {e}", input.name)))?;
    Ok(InputSlotSpec {
        name: input.name.clone(),
        schema: schema(&input.schema),
        from,
    })
}

fn output_spec(output: &OutputConfig) -> OutputSlotSpec {
    OutputSlotSpec {
        name: output.name.clone(),
        schema: schema(&output.schema),
        snapshot: output.snapshot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_config;
    use crate::errors::ValidationError;

    #[test]
    fn defaults_apply_to_minimal_config() {
        let cfg = parse_config(
            r#"
            [task.A]
            cmd = "echo A"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.graph.name, "dagwire");
        assert_eq!(cfg.options.parallelism, 4);
        assert_eq!(cfg.options.retry.max_retries, 2);
        assert_eq!(cfg.options.allocation_retry.max_retries, 3);
        assert_eq!(cfg.options.cancel_timeout, Duration::from_secs(5));
        assert_eq!(cfg.pools, vec!["local".to_string()]);
        assert!(cfg.state_dir.is_none());
    }

    #[test]
    fn slots_and_provisioning_are_carried_into_the_graph() {
        let cfg = parse_config(
            r#"
            [task.extract]
            cmd = "printf 'a\nb\n'"
            cpu = 2
            env = { MODE = "fast" }
            outputs = [{ name = "rows", schema = "csv", snapshot = true }]

            [task.load]
            cmd = "wc -l"
            inputs = [{ name = "rows", schema = "csv", from = "extract.rows" }]
            "#,
        )
        .unwrap();

        let extract = cfg.graph.task("extract").unwrap();
        assert_eq!(extract.exec.provisioning.cpu, 2);
        assert_eq!(extract.exec.provisioning.env.get("MODE").map(String::as_str), Some("fast"));
        assert!(extract.outputs[0].snapshot);

        let load = cfg.graph.task("load").unwrap();
        assert_eq!(load.inputs[0].from, SlotRef::new("extract", "rows"));
        assert_eq!(load.inputs[0].schema, DataSchema::new("csv"));
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let err = parse_config(
            r#"
            [scheduler]
            parallelism = 0

            [task.A]
            cmd = "true"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, DagwireError::ConfigError(msg) if msg.contains("parallelism")));
    }

    #[test]
    fn bad_durations_name_the_key() {
        let err = parse_config(
            r#"
            [retry]
            first_backoff = "soon"

            [task.A]
            cmd = "true"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, DagwireError::ConfigError(msg) if msg.contains("[retry].first_backoff")));
    }

    #[test]
    fn malformed_slot_reference_is_a_config_error() {
        let err = parse_config(
            r#"
            [task.A]
            cmd = "true"
            outputs = [{ name = "out" }]

            [task.B]
            cmd = "cat"
            inputs = [{ name = "in", from = "A" }]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, DagwireError::ConfigError(_)));
    }

    #[test]
    fn cycles_surface_as_validation_errors() {
        let err = parse_config(
            r#"
            [task.A]
            cmd = "true"
            after = ["B"]

            [task.B]
            cmd = "true"
            after = ["A"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, DagwireError::Validation(ValidationError::Cycle(_))));
    }

    #[test]
    fn empty_config_is_rejected() {
        let err = parse_config("").unwrap_err();
        assert!(matches!(err, DagwireError::ConfigError(_)));
    }
}
