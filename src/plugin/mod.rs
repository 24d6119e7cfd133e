//! The plugin registry.
//!
//! Datasets are served by plugins registered at startup and looked up by
//! name, never discovered dynamically. Four extension points exist:
//!
//! * Adapters rewrite envelopes at the engine boundary, inbound before
//!   planning and outbound before the reply is sent. Each adapter's name is
//!   recorded on the envelope as it runs, so downstream adapters and peers
//!   can see what already touched a message.
//! * Handlers execute leaf steps against a local shard.
//! * Collectors merge delivered values into a task's accumulated outputs,
//!   selected by the step kind. "reduce" and "gather" are built in.
//! * Step definitions describe how a request type expands into a plan.
//!
//! The built-in plan shape is the single-step plan: one leaf step fanned out
//! over shard replicas, one reduce step merging the partial results, and one
//! gather step relabeling them for the reply.

pub mod memory;

use std::collections::HashMap;

use serde_json::Value as Json;

use crate::catalog::{ReplicaPolicy, RouteMode};
use crate::dispatch::reduce::{self, Directive};
use crate::dispatch::Step;
use crate::errinput;
use crate::error::Result;
use crate::message::{Address, Envelope};

/// Accumulated task outputs by name.
pub type Values = serde_json::Map<String, Json>;

/// Rewrites envelopes at the engine boundary. Adapters see every dataset
/// request and filter on the envelope themselves.
pub trait Adapter: Send {
    fn name(&self) -> &str;
    /// Rewrites an inbound request before it is planned.
    fn adapt_input(&self, _envelope: &mut Envelope) -> Result<()> {
        Ok(())
    }
    /// Rewrites an outbound reply before it is sent.
    fn adapt_output(&self, _envelope: &mut Envelope) -> Result<()> {
        Ok(())
    }
}

/// Executes leaf steps against the local shard named by a task's route.
pub trait Handler: Send {
    /// Returns true if this handler executes the given command.
    fn processable(&self, kind: &str) -> bool;
    fn handle(&self, step: &Step, route: &Address) -> Result<Json>;
}

/// Merges one delivered value into a task's accumulated outputs.
pub trait Collector: Send {
    fn collect(&self, step: &Step, values: &mut Values, input: &str, value: &Json) -> Result<()>;
}

/// Describes how one request type executes.
#[derive(Clone, Debug)]
pub struct StepDefinition {
    /// The request type, e.g. "search".
    pub kind: String,
    /// Whether the leaf step hits one partition by key or all of them.
    pub mode: RouteMode,
    /// Replica selection within each partition.
    pub policy: ReplicaPolicy,
    /// True if the command writes.
    pub write: bool,
    /// How partial results merge.
    pub reduce: Directive,
    /// Per-request timeout override.
    pub timeout_seconds: Option<u64>,
}

/// The registry itself: everything the engine knows how to execute.
pub struct Registry {
    adapters: Vec<Box<dyn Adapter>>,
    handlers: Vec<Box<dyn Handler>>,
    collectors: HashMap<String, Box<dyn Collector>>,
    definitions: HashMap<String, StepDefinition>,
}

impl Registry {
    /// An empty registry with only the built-in collectors.
    pub fn new() -> Self {
        let mut registry = Self {
            adapters: Vec::new(),
            handlers: Vec::new(),
            collectors: HashMap::new(),
            definitions: HashMap::new(),
        };
        registry.register_collector("reduce", Box::new(ReduceCollector));
        registry.register_collector("gather", Box::new(GatherCollector));
        registry
    }

    /// A registry with the built-in record handler and its commands.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_handler(Box::new(memory::MemoryHandler::new()));
        for definition in memory::definitions() {
            registry.register_definition(definition);
        }
        registry
    }

    pub fn register_adapter(&mut self, adapter: Box<dyn Adapter>) {
        self.adapters.push(adapter);
    }

    pub fn register_handler(&mut self, handler: Box<dyn Handler>) {
        self.handlers.push(handler);
    }

    pub fn register_collector(&mut self, kind: impl Into<String>, collector: Box<dyn Collector>) {
        self.collectors.insert(kind.into(), collector);
    }

    pub fn register_definition(&mut self, definition: StepDefinition) {
        self.definitions.insert(definition.kind.clone(), definition);
    }

    /// Expands a request envelope into its abstract plan.
    pub fn plan(&self, envelope: &Envelope) -> Result<Vec<Step>> {
        let Some(definition) = self.definitions.get(&envelope.kind) else {
            return errinput!("unhandled request type {}", envelope.kind);
        };
        single_step_plan(definition, envelope)
    }

    /// Runs all input adapters over an inbound request, recording each on
    /// the envelope's adapter trail.
    pub fn adapt_input(&self, envelope: &mut Envelope) -> Result<()> {
        for adapter in &self.adapters {
            adapter.adapt_input(envelope)?;
            envelope.applied_adapters.push(adapter.name().to_owned());
        }
        Ok(())
    }

    /// Runs all output adapters over an outbound reply.
    pub fn adapt_output(&self, envelope: &mut Envelope) -> Result<()> {
        for adapter in &self.adapters {
            adapter.adapt_output(envelope)?;
        }
        Ok(())
    }

    /// Merges a delivered value into a task's outputs using the collector
    /// for the step kind. Steps without one accumulate under the input name.
    pub fn collect(&self, step: &Step, values: &mut Values, input: &str, value: &Json) -> Result<()> {
        match self.collectors.get(&step.kind) {
            Some(collector) => collector.collect(step, values, input, value),
            None => {
                values.insert(input.to_owned(), value.clone());
                Ok(())
            }
        }
    }

    /// Executes a leaf step with the first handler claiming its command.
    pub fn handle(&self, step: &Step, route: &Address) -> Result<Json> {
        for handler in &self.handlers {
            if handler.processable(&step.kind) {
                return handler.handle(step, route);
            }
        }
        errinput!("no handler for command {}", step.kind)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Expands a request into the standard three-step plan. The leaf step takes
/// its key and date range from the request body ("key", "dateRange"); the
/// error channel is threaded in later by the planner.
fn single_step_plan(definition: &StepDefinition, envelope: &Envelope) -> Result<Vec<Step>> {
    let body = &envelope.body;

    let mut leaf = Step::new(&definition.kind);
    leaf.dataset = envelope.dataset.clone();
    leaf.body = body.clone();
    leaf.mode = Some(definition.mode);
    leaf.policy = definition.policy;
    leaf.key = body.get("key").and_then(Json::as_str).map(ToOwned::to_owned);
    leaf.date_range =
        body.get("dateRange").map(|range| serde_json::from_value(range.clone())).transpose()?;
    leaf.write = definition.write;
    leaf.outputs = vec!["result".to_owned()];
    leaf.timeout_seconds = definition.timeout_seconds;

    let mut merge = Step::new("reduce");
    merge.inputs = vec!["result".to_owned()];
    merge.outputs = vec!["result_reduced".to_owned()];
    merge.body = serde_json::json!({"result": {"result_reduced": definition.reduce.clone()}});

    let mut gather = Step::new("gather");
    gather.inputs = vec!["result_reduced".to_owned()];
    gather.body = serde_json::json!({"result_reduced": {"output": "result"}});
    gather.post = true;

    Ok(vec![leaf, merge, gather])
}

/// Merges values per the reduce directives in the step body, which maps each
/// consumed input name to the outputs it feeds and their directives. The
/// first value for an output is stored as is; later ones are reduced into it.
struct ReduceCollector;

impl Collector for ReduceCollector {
    fn collect(&self, step: &Step, values: &mut Values, input: &str, value: &Json) -> Result<()> {
        let Some(mappings) = step.body.get(input).and_then(Json::as_object) else {
            return Ok(());
        };
        for (output, directive) in mappings {
            let directive: Directive = serde_json::from_value(directive.clone())?;
            let merged = match values.get(output) {
                Some(accumulated) => reduce::reduce(accumulated, value, &directive),
                None => value.clone(),
            };
            values.insert(output.clone(), merged);
        }
        Ok(())
    }
}

/// Relabels values per the gather mappings in the step body: each input maps
/// to {"output": name}. Unmapped inputs keep their own name.
struct GatherCollector;

impl Collector for GatherCollector {
    fn collect(&self, step: &Step, values: &mut Values, input: &str, value: &Json) -> Result<()> {
        let output = step
            .body
            .get(input)
            .and_then(|mapping| mapping.get("output"))
            .and_then(Json::as_str)
            .unwrap_or(input);
        values.insert(output.to_owned(), value.clone());
        Ok(())
    }
}
