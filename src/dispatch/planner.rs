//! Execution planning.
//!
//! Planning happens in two phases. The engine accepting a request orders
//! the abstract steps by their input/output dependencies, guarantees the
//! error channel exists, picks the session timeout, and fills in concrete
//! routes from the catalog and cluster state. Every engine receiving the
//! dispatched plan then derives the delivery bookkeeping (which nodes
//! consume each output, how many deliveries each task waits for) with
//! resolve_descendants, a computation all receivers perform identically
//! from the shared step list.

use std::collections::BTreeMap;

use log::error;
use serde_json::Value as Json;

use super::reduce::Directive;
use super::{graph, Step};
use crate::catalog::Catalog;
use crate::cluster::Membership;
use crate::error::Result;
use crate::message::Address;

/// The output name carrying per-node execution errors. Every plan merges it,
/// whether or not the plan's author asked for it.
pub const ERRORS: &str = "errors";

/// The reduced error channel produced by the plan's reduce step.
const ERRORS_REDUCED: &str = "errors_reduced";

/// An ordered, routed plan ready to dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    pub steps: Vec<Step>,
    /// The session timeout: the last per-step timeout seen across the
    /// ordered list, later steps overriding earlier ones.
    pub timeout_seconds: Option<u64>,
}

/// Turns abstract steps into a dispatchable plan.
pub struct ExecutionPlanner<'a> {
    catalog: &'a Catalog,
    membership: &'a Membership,
    /// The node collector steps run on.
    my_name: &'a Address,
}

impl<'a> ExecutionPlanner<'a> {
    pub fn new(catalog: &'a Catalog, membership: &'a Membership, my_name: &'a Address) -> Self {
        Self { catalog, membership, my_name }
    }

    /// Orders the steps, threads the error channel through them, computes
    /// routes, and folds per-step timeouts into one session timeout.
    pub fn plan(&self, dataset: &str, steps: Vec<Step>) -> Result<Plan> {
        let mut steps = ensure_error_channel(steps)?;
        let order = graph::sort(&steps)?;
        let mut ordered = Vec::with_capacity(steps.len());
        for i in order {
            ordered.push(std::mem::replace(&mut steps[i], Step::new("")));
        }
        let mut steps = ordered;

        let timeout_seconds = steps.iter().filter_map(step_timeout).last();
        for step in &mut steps {
            if step.is_leaf() && step.dataset.is_none() {
                step.dataset = Some(dataset.to_owned());
            }
            step.routes = self.routes(step, dataset)?;
        }
        Ok(Plan { steps, timeout_seconds })
    }

    /// Computes the destination addresses for one step. Leaf steps route
    /// through the ring within the cluster's writable or readable nodes;
    /// collector steps run on the planning node itself.
    fn routes(&self, step: &Step, dataset: &str) -> Result<Vec<Address>> {
        let Some(mode) = step.mode else {
            return Ok(vec![self.my_name.clone()]);
        };
        let range = step.date_range.clone().unwrap_or_default();
        let addresses =
            self.catalog.route(dataset, mode, step.key.as_deref(), &range, step.policy)?;

        let candidates = if step.write {
            self.membership.writable_nodes()
        } else {
            self.membership.readable_nodes()
        };
        let wanted = if step.write { "writable" } else { "readable" };
        if candidates.is_empty() {
            error!("No {wanted} nodes known, routing {} unrestricted", step.kind);
            return Ok(addresses);
        }
        let routed: Vec<Address> = addresses
            .iter()
            .filter(|address| candidates.iter().any(|node| node.same_node(address)))
            .cloned()
            .collect();
        if routed.is_empty() {
            error!("No replica for {} is on a {wanted} node, routing unrestricted", step.kind);
            return Ok(addresses);
        }
        Ok(routed)
    }
}

/// A step's own timeout: the explicit field, or one embedded in its body.
fn step_timeout(step: &Step) -> Option<u64> {
    step.timeout_seconds.or_else(|| step.body.get("timeoutSeconds").and_then(Json::as_u64))
}

/// Threads the error channel through a plan: leaf steps produce "errors",
/// reduce steps merge them by unlimited concatenation, and posting steps
/// surface the merged map. Plans that already wire the channel are left
/// alone.
fn ensure_error_channel(mut steps: Vec<Step>) -> Result<Vec<Step>> {
    let mut produced = false;
    for step in steps.iter_mut().filter(|step| step.is_leaf()) {
        if !step.outputs.iter().any(|output| output == ERRORS) {
            step.outputs.push(ERRORS.to_owned());
        }
        produced = true;
    }
    if !produced {
        return Ok(steps);
    }

    for step in steps.iter_mut().filter(|step| step.kind == "reduce") {
        if step.inputs.iter().any(|input| input == ERRORS) {
            continue;
        }
        step.inputs.push(ERRORS.to_owned());
        step.outputs.push(ERRORS_REDUCED.to_owned());
        if !step.body.is_object() {
            step.body = Json::Object(Default::default());
        }
        if let Json::Object(body) = &mut step.body {
            let mut mapping = serde_json::Map::new();
            mapping.insert(ERRORS_REDUCED.to_owned(), serde_json::to_value(Directive::errors())?);
            body.insert(ERRORS.to_owned(), Json::Object(mapping));
        }
    }

    let reduced = steps.iter().any(|step| step.outputs.iter().any(|o| o == ERRORS_REDUCED));
    if !reduced {
        return Ok(steps);
    }
    for step in steps.iter_mut().filter(|step| step.post) {
        if step.inputs.iter().any(|input| input == ERRORS_REDUCED) {
            continue;
        }
        step.inputs.push(ERRORS_REDUCED.to_owned());
        if !step.body.is_object() {
            step.body = Json::Object(Default::default());
        }
        if let Json::Object(body) = &mut step.body {
            body.insert(
                ERRORS_REDUCED.to_owned(),
                serde_json::json!({"output": ERRORS}),
            );
        }
    }
    Ok(steps)
}

/// Fills in each step's descendants and expected delivery count from the
/// routed step list. Descendants are deduplicated by node: each consuming
/// node gets one delivery per producing task, and its session fans the value
/// out to all local tasks awaiting that input.
pub fn resolve_descendants(steps: &mut [Step]) {
    // Total deliveries per output name: one per producing task (route).
    let mut deliveries: BTreeMap<String, usize> = BTreeMap::new();
    for step in steps.iter() {
        for output in &step.outputs {
            *deliveries.entry(output.clone()).or_default() += step.routes.len();
        }
    }

    // Consuming nodes per output name.
    let mut consumers: BTreeMap<String, Vec<Address>> = BTreeMap::new();
    for step in steps.iter() {
        for input in &step.inputs {
            let nodes = consumers.entry(input.clone()).or_default();
            for route in &step.routes {
                if !nodes.iter().any(|node| node.same_node(route)) {
                    nodes.push(route.node());
                }
            }
        }
    }

    for step in steps.iter_mut() {
        step.n_of_expects =
            step.inputs.iter().map(|input| deliveries.get(input).copied().unwrap_or(0)).sum();
        step.descendants = step
            .outputs
            .iter()
            .filter_map(|output| {
                consumers.get(output).map(|nodes| (output.clone(), nodes.clone()))
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RouteMode;
    use crate::cluster::Role;
    use serde_json::json;

    fn address(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn catalog() -> Catalog {
        Catalog::parse(
            r#"{
                "version": 2,
                "datasets": {
                    "blog": {
                        "numPartitions": 2,
                        "ring": {
                            "p0": {"weight": 1, "partitions": {"2024-01-01": ["node0:10031/engine.000"]}},
                            "p1": {"weight": 1, "partitions": {"2024-01-01": ["node1:10031/engine.000"]}}
                        }
                    }
                }
            }"#,
        )
        .unwrap()
    }

    fn membership(dir: &std::path::Path, raw: &str) -> Membership {
        let path = dir.join("cluster.json");
        std::fs::write(&path, raw).unwrap();
        Membership::load(address("node0:10031/engine"), path)
    }

    fn full_membership(dir: &std::path::Path) -> Membership {
        membership(
            dir,
            r#"{
                "node0:10031/engine": {"role": "service-provider", "live": true},
                "node1:10031/engine": {"role": "service-provider", "live": true}
            }"#,
        )
    }

    fn abstract_plan() -> Vec<Step> {
        let mut search = Step::new("search");
        search.mode = Some(RouteMode::Broadcast);
        search.outputs = vec!["result".into()];
        search.body = json!({"query": "x"});

        let mut merge = Step::new("reduce");
        merge.inputs = vec!["result".into()];
        merge.outputs = vec!["result_reduced".into()];
        merge.body = json!({"result": {"result_reduced": {"type": "sum", "limit": -1}}});

        let mut gather = Step::new("gather");
        gather.inputs = vec!["result_reduced".into()];
        gather.body = json!({"result_reduced": {"output": "result"}});
        gather.post = true;

        // Deliberately out of order: the planner must sort them.
        vec![gather, merge, search]
    }

    #[test]
    fn plans_route_and_thread_the_error_channel() {
        let dir = tempfile::tempdir().unwrap();
        let me = address("node0:10031/engine");
        let membership = full_membership(dir.path());
        let catalog = catalog();
        let planner = ExecutionPlanner::new(&catalog, &membership, &me);

        let plan = planner.plan("blog", abstract_plan()).unwrap();
        assert_eq!(
            plan.steps.iter().map(|s| s.kind.as_str()).collect::<Vec<_>>(),
            vec!["search", "reduce", "gather"]
        );

        let search = &plan.steps[0];
        assert_eq!(search.routes.len(), 2, "broadcast covers both partitions");
        assert!(search.outputs.iter().any(|o| o == ERRORS));
        assert_eq!(search.dataset.as_deref(), Some("blog"));

        let merge = &plan.steps[1];
        assert_eq!(merge.routes, vec![me.clone()]);
        assert!(merge.inputs.iter().any(|i| i == ERRORS));
        assert!(merge.body["errors"]["errors_reduced"].is_object());

        let gather = &plan.steps[2];
        assert_eq!(gather.body["errors_reduced"]["output"], "errors");
    }

    #[test]
    fn read_steps_avoid_unreadable_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let me = address("node0:10031/engine");
        let membership = membership(
            dir.path(),
            r#"{
                "node0:10031/engine": {"role": "service-provider", "live": true},
                "node1:10031/engine": {"role": "service-provider", "live": false}
            }"#,
        );
        let catalog = catalog();
        let planner = ExecutionPlanner::new(&catalog, &membership, &me);
        let plan = planner.plan("blog", abstract_plan()).unwrap();
        let search = &plan.steps[0];
        assert_eq!(search.routes.len(), 1);
        assert!(search.routes[0].same_node(&me));
    }

    #[test]
    fn empty_candidate_sets_fall_back_to_unrestricted_routing() {
        let dir = tempfile::tempdir().unwrap();
        let me = address("node0:10031/engine");
        // Every node is dead: degraded mode still routes everywhere.
        let membership = membership(
            dir.path(),
            r#"{
                "node0:10031/engine": {"role": "service-provider", "live": false},
                "node1:10031/engine": {"role": "service-provider", "live": false}
            }"#,
        );
        let catalog = catalog();
        let planner = ExecutionPlanner::new(&catalog, &membership, &me);
        let plan = planner.plan("blog", abstract_plan()).unwrap();
        assert_eq!(plan.steps[0].routes.len(), 2);
    }

    #[test]
    fn write_steps_honor_role_writability() {
        let dir = tempfile::tempdir().unwrap();
        let me = address("node0:10031/engine");
        // node1 absorbs data from elsewhere: a service-provider must not
        // write to it, but node0 itself remains writable.
        let membership = membership(
            dir.path(),
            r#"{
                "node0:10031/engine": {"role": "service-provider", "live": true},
                "node1:10031/engine": {"role": "absorb-destination", "live": true}
            }"#,
        );
        assert_eq!(membership.my_role(), Role::ServiceProvider);
        let catalog = catalog();
        let planner = ExecutionPlanner::new(&catalog, &membership, &me);

        let mut add = Step::new("add");
        add.mode = Some(RouteMode::Broadcast);
        add.write = true;
        add.outputs = vec!["result".into()];
        let plan = planner.plan("blog", vec![add]).unwrap();
        assert_eq!(plan.steps[0].routes.len(), 1);
        assert!(plan.steps[0].routes[0].same_node(&me));
    }

    #[test]
    fn the_last_step_timeout_wins() {
        let dir = tempfile::tempdir().unwrap();
        let me = address("node0:10031/engine");
        let membership = full_membership(dir.path());
        let catalog = catalog();
        let planner = ExecutionPlanner::new(&catalog, &membership, &me);

        let mut steps = abstract_plan();
        steps[2].timeout_seconds = Some(10); // search
        steps[1].body["timeoutSeconds"] = json!(25); // reduce, embedded
        let plan = planner.plan("blog", steps).unwrap();
        assert_eq!(plan.timeout_seconds, Some(25));
    }

    #[test]
    fn resolve_descendants_counts_expected_deliveries() {
        let dir = tempfile::tempdir().unwrap();
        let me = address("node0:10031/engine");
        let membership = full_membership(dir.path());
        let catalog = catalog();
        let planner = ExecutionPlanner::new(&catalog, &membership, &me);
        let mut plan = planner.plan("blog", abstract_plan()).unwrap();
        resolve_descendants(&mut plan.steps);

        let search = &plan.steps[0];
        // Both outputs flow to the one collector node.
        assert_eq!(search.n_of_expects, 0);
        assert_eq!(search.descendants["result"], vec![me.node()]);
        assert_eq!(search.descendants["errors"], vec![me.node()]);

        let merge = &plan.steps[1];
        // One delivery per search task, for each of result and errors.
        assert_eq!(merge.n_of_expects, 4);
        assert_eq!(merge.descendants["result_reduced"], vec![me.node()]);

        let gather = &plan.steps[2];
        assert_eq!(gather.n_of_expects, 2);
        assert!(gather.descendants.is_empty());
    }
}
