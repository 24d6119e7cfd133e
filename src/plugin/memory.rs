//! An in-memory record handler.
//!
//! This is the smallest handler that makes the engine end-to-end runnable
//! without an external storage service: each shard is a vector of JSON
//! records keyed by dataset and local shard name. It registers three
//! commands covering the routing modes: "add" scatters a record to its
//! partition, "search" broadcasts a substring match, and "count" broadcasts
//! a size query.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Value as Json};

use super::{Handler, StepDefinition};
use crate::catalog::{ReplicaPolicy, RouteMode};
use crate::dispatch::reduce::{Directive, Kind};
use crate::dispatch::Step;
use crate::errinput;
use crate::error::Result;
use crate::message::Address;

/// The step definitions for the built-in commands.
pub fn definitions() -> Vec<StepDefinition> {
    vec![
        // Writes go to every replica of the owning partition, and succeed
        // only if all of them stored the record.
        StepDefinition {
            kind: "add".to_owned(),
            mode: RouteMode::Scatter,
            policy: ReplicaPolicy::All,
            write: true,
            reduce: Directive::new(Kind::And),
            timeout_seconds: None,
        },
        // Reads take one replica per partition. Recursive sum merges the
        // result shape: counts add, record lists concatenate.
        StepDefinition {
            kind: "search".to_owned(),
            mode: RouteMode::Broadcast,
            policy: ReplicaPolicy::Random,
            write: false,
            reduce: Directive::new(Kind::RecursiveSum),
            timeout_seconds: None,
        },
        StepDefinition {
            kind: "count".to_owned(),
            mode: RouteMode::Broadcast,
            policy: ReplicaPolicy::Random,
            write: false,
            reduce: Directive::new(Kind::Sum),
            timeout_seconds: None,
        },
    ]
}

/// The handler. Shards live behind one mutex; commands are short and the
/// engine loop is single-threaded, so contention isn't a concern.
pub struct MemoryHandler {
    shards: Mutex<HashMap<(String, String), Vec<Json>>>,
}

impl MemoryHandler {
    pub fn new() -> Self {
        Self { shards: Mutex::new(HashMap::new()) }
    }

    /// The shard a task's route points at.
    fn shard_key(step: &Step, route: &Address) -> (String, String) {
        let dataset = step.dataset.clone().unwrap_or_default();
        let shard = route.local.clone().unwrap_or_default();
        (dataset, shard)
    }
}

impl Default for MemoryHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for MemoryHandler {
    fn processable(&self, kind: &str) -> bool {
        matches!(kind, "add" | "search" | "count")
    }

    fn handle(&self, step: &Step, route: &Address) -> Result<Json> {
        let mut shards = self.shards.lock()?;
        let records = shards.entry(Self::shard_key(step, route)).or_default();
        match step.kind.as_str() {
            "add" => {
                let record = step
                    .body
                    .get("record")
                    .cloned()
                    .ok_or_else(|| crate::error::Error::BadRequest("missing record".to_owned()))?;
                records.push(record);
                Ok(json!(true))
            }
            "search" => {
                let query = step.body.get("query").and_then(Json::as_str);
                let matched: Vec<Json> =
                    records.iter().filter(|record| matches(record, query)).cloned().collect();
                Ok(json!({"count": matched.len(), "records": matched}))
            }
            "count" => Ok(json!(records.len())),
            kind => errinput!("unhandled command {kind}"),
        }
    }
}

/// A record matches if the query is a substring of its JSON rendering. No
/// query matches everything.
fn matches(record: &Json, query: Option<&str>) -> bool {
    let Some(query) = query else { return true };
    record.to_string().contains(query)
}
