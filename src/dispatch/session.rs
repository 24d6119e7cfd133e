//! Session and task tracking for one distributed execution.
//!
//! Every engine participating in a plan runs a session under the shared
//! execution id. The session owns one task per (step, local route) pair:
//! tasks for leaf steps execute a command against a local shard, tasks for
//! collector steps wait for partial results delivered under the input names
//! they consume. A task completes when its delivery count reaches the
//! planner's expectation, then hands each of its outputs to the consuming
//! nodes recorded in the step's descendants.
//!
//! Sessions are pure state machines: they never touch the network or the
//! handlers. Everything with a side effect is returned as an [`Effect`] for
//! the dispatcher to carry out, which keeps the delivery accounting
//! testable without wiring up transports.

use std::collections::BTreeMap;

use log::warn;
use serde_json::Value as Json;

use super::Step;
use crate::error::Result;
use crate::message::Address;
use crate::plugin::{Registry, Values};

/// A side effect requested by a session transition.
#[derive(Debug)]
pub enum Effect {
    /// Execute the task's leaf step against its local shard.
    Execute { task: usize },
    /// Deliver an output value to the nodes consuming it. The routes may
    /// include this node; the dispatcher short-circuits those locally.
    Deliver { input: String, value: Json, routes: Vec<Address> },
    /// Feed accumulated values to the reply path.
    Post { values: Json },
}

/// One unit of local work: a step bound to one of its local routes.
struct Task {
    /// Index of the step in the session's plan.
    step: usize,
    /// The route the task runs for, selecting the local shard replica.
    route: Address,
    /// Deliveries received so far.
    n_of_inputs: usize,
    /// Accumulated output values.
    values: Values,
    /// Whether the task has completed. Completion fires exactly once; late
    /// deliveries to a done task are dropped.
    done: bool,
}

/// The session for one execution id on one engine.
pub struct Session {
    id: String,
    /// The full plan, with routes, descendants, and expectations resolved.
    steps: Vec<Step>,
    tasks: Vec<Task>,
    /// Task indexes by awaited input name.
    tasks_by_input: BTreeMap<String, Vec<usize>>,
    n_done: usize,
    /// The engine tick at which the session times out.
    pub expires_at: u64,
}

impl Session {
    /// Creates the session for a dispatched plan, materializing a task for
    /// every step route on this node. Steps without local routes get none.
    pub fn new(id: impl Into<String>, my_name: &Address, steps: Vec<Step>, expires_at: u64) -> Self {
        let mut tasks = Vec::new();
        let mut tasks_by_input: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (step_index, step) in steps.iter().enumerate() {
            for route in &step.routes {
                if !route.same_node(my_name) {
                    continue;
                }
                let task_index = tasks.len();
                tasks.push(Task {
                    step: step_index,
                    route: route.clone(),
                    n_of_inputs: 0,
                    values: Values::new(),
                    done: false,
                });
                for input in &step.inputs {
                    tasks_by_input.entry(input.clone()).or_default().push(task_index);
                }
            }
        }
        Self { id: id.into(), steps, tasks, tasks_by_input, n_done: 0, expires_at }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns true once every local task has completed.
    pub fn done(&self) -> bool {
        self.n_done == self.tasks.len()
    }

    /// The step and route a task executes, for carrying out an
    /// [`Effect::Execute`].
    pub fn task(&self, task: usize) -> (&Step, &Address) {
        (&self.steps[self.tasks[task].step], &self.tasks[task].route)
    }

    /// Kicks the session off: tasks expecting no deliveries are ready
    /// immediately. Leaf tasks are handed out for execution; a collector
    /// task with nothing to wait for completes on the spot.
    pub fn start(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        for index in 0..self.tasks.len() {
            if self.steps[self.tasks[index].step].n_of_expects > 0 {
                continue;
            }
            if self.steps[self.tasks[index].step].is_leaf() {
                effects.push(Effect::Execute { task: index });
            } else {
                effects.extend(self.finish_task(index));
            }
        }
        effects
    }

    /// Completes an executed task with the values its command produced.
    pub fn complete(&mut self, task: usize, values: Values) -> Vec<Effect> {
        self.tasks[task].values = values;
        self.finish_task(task)
    }

    /// Accepts one delivered partial result, fanning it out to every local
    /// task awaiting the input name. Values merge through the collector for
    /// the task's step kind; tasks reaching their expected delivery count
    /// complete. A delivery no task awaits is dropped.
    pub fn receive(
        &mut self,
        input: &str,
        value: &Json,
        registry: &Registry,
    ) -> Result<Vec<Effect>> {
        let indexes = self.tasks_by_input.get(input).cloned().unwrap_or_default();
        if indexes.is_empty() {
            warn!("Dropping result for unknown input {input} in session {}", self.id);
            return Ok(Vec::new());
        }
        let mut effects = Vec::new();
        for index in indexes {
            if self.tasks[index].done {
                continue;
            }
            self.tasks[index].n_of_inputs += 1;
            let step_index = self.tasks[index].step;
            {
                let (step, task) = (&self.steps[step_index], &mut self.tasks[index]);
                registry.collect(step, &mut task.values, input, value)?;
            }
            if self.tasks[index].n_of_inputs >= self.steps[step_index].n_of_expects {
                effects.extend(self.finish_task(index));
            }
        }
        Ok(effects)
    }

    /// Marks a task done and emits its outgoing effects: one delivery per
    /// consuming node and output, plus the reply feed for post steps.
    /// Outputs the task never accumulated a value for deliver null, so
    /// downstream expectations still come due.
    fn finish_task(&mut self, index: usize) -> Vec<Effect> {
        if self.tasks[index].done {
            return Vec::new();
        }
        self.tasks[index].done = true;
        self.n_done += 1;

        let task = &self.tasks[index];
        let step = &self.steps[task.step];
        let mut effects = Vec::new();
        for (output, routes) in &step.descendants {
            let value = task.values.get(output).cloned().unwrap_or(Json::Null);
            effects.push(Effect::Deliver { input: output.clone(), value, routes: routes.clone() });
        }
        if step.post {
            effects.push(Effect::Post { values: Json::Object(task.values.clone()) });
        }
        effects
    }
}
