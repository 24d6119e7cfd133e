//! Execution plan steps and the internal dispatch messages that carry them.
//!
//! A plan is an ordered list of steps. Leaf steps (those with a routing mode)
//! execute a command against shard replicas; collector steps ("reduce",
//! "gather") consume the outputs of other steps by name and run on the node
//! that accepted the original request. Steps travel between engines inside
//! "dispatcher"-typed envelopes, so every field here has a stable wire name.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::catalog::{DateRange, ReplicaPolicy, RouteMode};
use crate::message::Address;

/// One node of an execution plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// The command the step executes, e.g. "search", or a collector kind
    /// like "reduce" or "gather".
    #[serde(rename = "type")]
    pub kind: String,
    /// The dataset the step runs against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    /// The command payload. For collector steps this maps each consumed
    /// input name to its merge directives.
    #[serde(default)]
    pub body: Json,
    /// Output names this step consumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    /// Output names this step produces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    /// How a leaf step fans out over partitions. Collector steps have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RouteMode>,
    /// Replica selection within each partition.
    #[serde(default)]
    pub policy: ReplicaPolicy,
    /// The shard key, required when the mode is scatter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Restricts routing to slices covering this range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    /// True if the step writes, restricting it to writable nodes.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub write: bool,
    /// True if the step's accumulated values feed the final reply.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub post: bool,
    /// Concrete destination addresses, filled in by the planner.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Address>,
    /// Consumers of each output, resolved by the session planner on the
    /// receiving side: output name to the nodes awaiting it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub descendants: BTreeMap<String, Vec<Address>>,
    /// How many deliveries a task of this step waits for before completing.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub n_of_expects: usize,
    /// Per-step timeout. The planner folds these into the session timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl Step {
    /// Creates a bare step with the given command kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            dataset: None,
            body: Json::Null,
            inputs: Vec::new(),
            outputs: Vec::new(),
            mode: None,
            policy: ReplicaPolicy::default(),
            key: None,
            date_range: None,
            write: false,
            post: false,
            routes: Vec::new(),
            descendants: BTreeMap::new(),
            n_of_expects: 0,
            timeout_seconds: None,
        }
    }

    /// Returns true if this is a leaf step executing on shard replicas, as
    /// opposed to a collector step running where the plan was made.
    pub fn is_leaf(&self) -> bool {
        self.mode.is_some()
    }
}

/// The body of an internal envelope dispatching a plan: the receiving engine
/// creates a session for the id and runs the steps routed to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatch {
    /// The execution id, shared by every node participating in the plan.
    pub id: String,
    /// The full ordered step list. Each receiver picks out its own tasks.
    pub steps: Vec<Step>,
    /// The session timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// The body of an internal envelope delivering one partial result to the
/// session tracking the execution id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deliver {
    /// The execution id.
    pub id: String,
    /// The output name this value was produced under.
    pub input: String,
    /// The produced value.
    #[serde(default)]
    pub value: Json,
}

/// The payload of a dispatcher envelope: a plan to execute, or one partial
/// result for an execution in flight. The shapes are disjoint ("steps"
/// versus "input"), so no tag is needed on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Internal {
    Dispatch(Dispatch),
    Deliver(Deliver),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_wire_names() {
        let mut step = Step::new("search");
        step.dataset = Some("blog".into());
        step.mode = Some(RouteMode::Scatter);
        step.key = Some("user1".into());
        step.write = false;
        step.outputs = vec!["errors".into(), "result".into()];
        step.n_of_expects = 0;
        step.timeout_seconds = Some(10);

        let wire = serde_json::to_value(&step).unwrap();
        assert_eq!(wire["type"], "search");
        assert_eq!(wire["mode"], "scatter");
        assert_eq!(wire["timeoutSeconds"], 10);
        assert!(wire.get("write").is_none(), "false flags stay off the wire");
        assert!(wire.get("nOfExpects").is_none());
        assert!(wire.get("routes").is_none());

        let back: Step = serde_json::from_value(wire).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn dispatch_round_trips_with_camel_case() {
        let dispatch = Dispatch {
            id: "execution-1".into(),
            steps: vec![Step::new("count")],
            timeout_seconds: Some(30),
        };
        let wire = serde_json::to_value(&dispatch).unwrap();
        assert_eq!(wire["timeoutSeconds"], 30);
        assert_eq!(wire["steps"][0]["type"], "count");
        let back: Dispatch = serde_json::from_value(wire).unwrap();
        assert_eq!(back, dispatch);
    }

    #[test]
    fn deliver_defaults_missing_value_to_null() {
        let deliver: Deliver =
            serde_json::from_value(json!({"id": "x", "input": "result"})).unwrap();
        assert_eq!(deliver.value, Json::Null);
    }
}
