// src/dag/validate.rs

//! Submission-time graph validation. Nothing is registered for a graph that
//! fails here.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use regex::Regex;

use crate::dag::graph::{Graph, OutputSlotSpec};
use crate::errors::ValidationError;
use crate::types::TaskId;

static NAME: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").ok());

fn valid_name(name: &str) -> bool {
    NAME.as_ref().is_some_and(|re| re.is_match(name))
}

/// Validate a graph and return its tasks in a dependency-respecting order.
pub fn validate_graph(graph: &Graph) -> Result<Vec<TaskId>, ValidationError> {
    if graph.tasks.is_empty() {
        return Err(ValidationError::EmptyGraph);
    }

    let outputs = validate_tasks(graph)?;
    validate_dependencies(graph, &outputs)?;
    topological_order(graph)
}

/// Names, uniqueness, and the per-task output table.
fn validate_tasks(graph: &Graph) -> Result<HashMap<&str, HashMap<&str, &OutputSlotSpec>>, ValidationError> {
    let mut outputs: HashMap<&str, HashMap<&str, &OutputSlotSpec>> = HashMap::new();

    for task in &graph.tasks {
        if !valid_name(&task.id) {
            return Err(ValidationError::InvalidName(task.id.clone()));
        }
        if outputs.contains_key(task.id.as_str()) {
            return Err(ValidationError::DuplicateTask(task.id.clone()));
        }

        let mut slot_names = HashSet::new();
        let names = task
            .inputs
            .iter()
            .map(|i| &i.name)
            .chain(task.outputs.iter().map(|o| &o.name));
        for name in names {
            if !valid_name(name) {
                return Err(ValidationError::InvalidName(name.clone()));
            }
            if !slot_names.insert(name.as_str()) {
                return Err(ValidationError::DuplicateSlot {
                    task: task.id.clone(),
                    slot: name.clone(),
                });
            }
        }

        outputs.insert(
            task.id.as_str(),
            task.outputs.iter().map(|o| (o.name.as_str(), o)).collect(),
        );
    }

    Ok(outputs)
}

fn validate_dependencies(
    graph: &Graph,
    outputs: &HashMap<&str, HashMap<&str, &OutputSlotSpec>>,
) -> Result<(), ValidationError> {
    for task in &graph.tasks {
        for dep in &task.after {
            if dep == &task.id {
                return Err(ValidationError::SelfDependency(task.id.clone()));
            }
            if !outputs.contains_key(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    task: task.id.clone(),
                    dep: dep.clone(),
                });
            }
        }

        for input in &task.inputs {
            let producer = &input.from.task;
            if producer == &task.id {
                return Err(ValidationError::SelfDependency(task.id.clone()));
            }
            let Some(slots) = outputs.get(producer.as_str()) else {
                return Err(ValidationError::UnknownDependency {
                    task: task.id.clone(),
                    dep: producer.clone(),
                });
            };
            let Some(output) = slots.get(input.from.slot.as_str()) else {
                return Err(ValidationError::UnknownSlot {
                    task: task.id.clone(),
                    producer: producer.clone(),
                    slot: input.from.slot.clone(),
                });
            };
            if output.schema != input.schema {
                return Err(ValidationError::SchemaMismatch {
                    consumer: format!("{}.{}", task.id, input.name),
                    producer: input.from.to_string(),
                    expected: input.schema.to_string(),
                    found: output.schema.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn topological_order(graph: &Graph) -> Result<Vec<TaskId>, ValidationError> {
    // Edge direction: dep -> task.
    let mut dag: DiGraphMap<&str, ()> = DiGraphMap::new();
    for task in &graph.tasks {
        dag.add_node(task.id.as_str());
    }
    for task in &graph.tasks {
        for dep in task.after.iter().chain(task.inputs.iter().map(|i| &i.from.task)) {
            dag.add_edge(dep.as_str(), task.id.as_str(), ());
        }
    }

    match toposort(&dag, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(cycle) => Err(ValidationError::Cycle(cycle.node_id().to_string())),
    }
}
