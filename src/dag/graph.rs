// src/dag/graph.rs

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::channel::spec::DataSchema;
use crate::exec::ProvisioningSpec;
use crate::types::TaskId;

/// A submitted workflow: tasks plus their dependency edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub name: String,
    pub tasks: Vec<TaskSpec>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// What to run and where.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub cmd: String,
    #[serde(default)]
    pub provisioning: ProvisioningSpec,
}

/// `<task>.<slot>` reference to a producer's output slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotRef {
    pub task: TaskId,
    pub slot: String,
}

impl SlotRef {
    pub fn new(task: impl Into<TaskId>, slot: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            slot: slot.into(),
        }
    }
}

impl FromStr for SlotRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((task, slot)) if !task.is_empty() && !slot.is_empty() => Ok(SlotRef::new(task, slot)),
            _ => Err(format!("invalid slot reference '{s}': expected '<task>.<slot>'")),
        }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.task, self.slot)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSlotSpec {
    pub name: String,
    #[serde(default)]
    pub schema: DataSchema,
    pub from: SlotRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSlotSpec {
    pub name: String,
    #[serde(default)]
    pub schema: DataSchema,
    /// Persist through storage instead of streaming point-to-point.
    #[serde(default)]
    pub snapshot: bool,
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub exec: ExecutionSpec,
    /// Ordering-only dependencies.
    #[serde(default)]
    pub after: Vec<TaskId>,
    #[serde(default)]
    pub inputs: Vec<InputSlotSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSlotSpec>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, cmd: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            exec: ExecutionSpec {
                cmd: cmd.into(),
                provisioning: ProvisioningSpec::default(),
            },
            after: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// `after` plus every task an input reads from.
    pub fn dependencies(&self) -> BTreeSet<TaskId> {
        self.after
            .iter()
            .cloned()
            .chain(self.inputs.iter().map(|i| i.from.task.clone()))
            .collect()
    }
}

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone)]
struct DagNode {
    deps: Vec<TaskId>,
    dependents: Vec<TaskId>,
}

/// Adjacency view of a validated [`Graph`].
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: HashMap<TaskId, DagNode>,
}

impl DagGraph {
    /// Assumes the graph has been validated (known deps, no cycles).
    pub fn from_graph(graph: &Graph) -> Self {
        let mut nodes: HashMap<TaskId, DagNode> = graph
            .tasks
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    DagNode {
                        deps: t.dependencies().into_iter().collect(),
                        dependents: Vec::new(),
                    },
                )
            })
            .collect();

        for task in &graph.tasks {
            for dep in task.dependencies() {
                if let Some(dep_node) = nodes.get_mut(&dep) {
                    dep_node.dependents.push(task.id.clone());
                }
            }
        }

        for node in nodes.values_mut() {
            node.dependents.sort();
        }

        Self { nodes }
    }

    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    pub fn dependencies_of(&self, name: &str) -> &[TaskId] {
        self.nodes.get(name).map(|n| n.deps.as_slice()).unwrap_or(&[])
    }

    pub fn dependents_of(&self, name: &str) -> &[TaskId] {
        self.nodes
            .get(name)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Every task reachable downstream of `name`, excluding `name`.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependents_of(name).iter().map(String::as_str).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.to_string()) {
                stack.extend(self.dependents_of(next).iter().map(String::as_str));
            }
        }
        seen
    }
}
