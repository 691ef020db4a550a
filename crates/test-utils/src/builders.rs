use dagwire::channel::DataSchema;
use dagwire::dag::{Graph, InputSlotSpec, OutputSlotSpec, SlotRef, TaskSpec};

/// Builder for [`Graph`] to simplify test setup.
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            graph: Graph::new(name),
        }
    }

    pub fn task(mut self, task: TaskBuilder) -> Self {
        self.graph.tasks.push(task.build());
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}

/// Builder for [`TaskSpec`]. The command defaults to `true`.
pub struct TaskBuilder {
    task: TaskSpec,
}

impl TaskBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            task: TaskSpec::new(id, "true"),
        }
    }

    pub fn cmd(mut self, cmd: &str) -> Self {
        self.task.exec.cmd = cmd.to_string();
        self
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn pool(mut self, pool: &str) -> Self {
        self.task.exec.provisioning.pool = pool.to_string();
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.task.exec.provisioning.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Direct output slot with the default schema.
    pub fn output(self, name: &str) -> Self {
        self.output_with(name, DataSchema::default(), false)
    }

    pub fn snapshot_output(self, name: &str) -> Self {
        self.output_with(name, DataSchema::default(), true)
    }

    pub fn output_with(mut self, name: &str, schema: DataSchema, snapshot: bool) -> Self {
        self.task.outputs.push(OutputSlotSpec {
            name: name.to_string(),
            schema,
            snapshot,
        });
        self
    }

    /// Input slot reading `from` (`"<task>.<slot>"`).
    pub fn input(self, name: &str, from: &str) -> Self {
        self.input_with(name, from, DataSchema::default())
    }

    pub fn input_with(mut self, name: &str, from: &str, schema: DataSchema) -> Self {
        let from: SlotRef = from.parse().expect("slot reference must be '<task>.<slot>'");
        self.task.inputs.push(InputSlotSpec {
            name: name.to_string(),
            schema,
            from,
        });
        self
    }

    pub fn build(self) -> TaskSpec {
        self.task
    }
}

/// `A -> B, A -> C, B -> D, C -> D`, wired through `out`/`in_*` slots.
pub fn diamond() -> Graph {
    GraphBuilder::new("diamond")
        .task(TaskBuilder::new("A").output("out"))
        .task(TaskBuilder::new("B").input("in", "A.out").output("out"))
        .task(TaskBuilder::new("C").input("in", "A.out").output("out"))
        .task(
            TaskBuilder::new("D")
                .input("in_b", "B.out")
                .input("in_c", "C.out"),
        )
        .build()
}
