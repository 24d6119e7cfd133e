//! The dispatcher: one engine's request processor.
//!
//! The dispatcher owns the live sessions and the requests awaiting replies.
//! It is single-threaded and channel-driven: the server's event loop feeds
//! it inbound envelopes and clock ticks, and everything it sends out goes
//! through the outbox channel for the forwarding side to deliver. Client
//! requests are planned, dispatched to every participating node, and tracked
//! until their session posts a result or times out; internal envelopes from
//! peers register dispatched plans and route partial results into sessions.
//!
//! A malformed or failing message is never allowed to take the process down.
//! Request failures reply to the client with the error's status code, and
//! failures with nobody to tell are logged.

use std::collections::{BTreeMap, VecDeque};

use crossbeam::channel::Sender;
use log::{debug, error, warn};
use serde_json::{json, Value as Json};
use uuid::Uuid;

use super::planner::{resolve_descendants, ExecutionPlanner, Plan, ERRORS};
use super::session::{Effect, Session};
use super::step::{Deliver, Dispatch, Internal, Step};
use super::TICKS_PER_SECOND;
use crate::catalog::Catalog;
use crate::cluster::Membership;
use crate::errinput;
use crate::error::{Error, Result};
use crate::message::{Address, Envelope};
use crate::plugin::{Registry, Values};

/// The request type answered locally with cluster status, never planned.
pub const STATUS: &str = "status";

pub struct Dispatcher {
    my_name: Address,
    registry: Registry,
    /// Live sessions by execution id.
    sessions: BTreeMap<String, Session>,
    /// Original requests awaiting a reply, by execution id.
    pending: BTreeMap<String, Envelope>,
    /// Outbound envelopes and their destination nodes, delivered by the
    /// server's forwarding side.
    outbox: Sender<(Envelope, Address)>,
    /// The current tick.
    now: u64,
    /// Session timeout in ticks for plans that declare none.
    default_timeout: u64,
}

impl Dispatcher {
    pub fn new(
        my_name: Address,
        registry: Registry,
        outbox: Sender<(Envelope, Address)>,
        default_timeout_seconds: u64,
    ) -> Self {
        Self {
            my_name,
            registry,
            sessions: BTreeMap::new(),
            pending: BTreeMap::new(),
            outbox,
            now: 0,
            default_timeout: default_timeout_seconds.saturating_mul(TICKS_PER_SECOND),
        }
    }

    /// The number of live sessions.
    pub fn sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Processes one inbound envelope against the current catalog and
    /// cluster state. Never fails: request errors reply to the sender, and
    /// internal failures are logged.
    pub fn process(&mut self, envelope: Envelope, catalog: &Catalog, membership: &Membership) {
        if envelope.is_internal() {
            if let Err(error) = self.process_internal(&envelope) {
                error!("Failed to process internal envelope: {error}");
            }
            return;
        }
        if let Err(error) = self.process_request(&envelope, catalog, membership) {
            if error.is_client_error() {
                debug!("Rejecting {} request: {error}", envelope.kind);
            } else {
                error!("Processing {} request failed: {error}", envelope.kind);
            }
            let reply = envelope.reply(error.status_code(), reply_body(&error));
            self.post(reply, envelope.reply_destination());
        }
    }

    /// Advances time one tick, expiring sessions past their deadline. A
    /// timed-out session is dropped along with its partial results; any
    /// pending reply is abandoned rather than answered, so clients need
    /// their own timeouts.
    pub fn tick(&mut self) {
        self.now += 1;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.expires_at <= self.now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            warn!("Session {id} timed out, discarding partial results");
            self.sessions.remove(&id);
            self.pending.remove(&id);
        }
    }

    /// Handles a client request: status queries answer immediately; anything
    /// else is adapted, validated against the catalog, planned, and
    /// dispatched.
    fn process_request(
        &mut self,
        envelope: &Envelope,
        catalog: &Catalog,
        membership: &Membership,
    ) -> Result<()> {
        if envelope.kind == STATUS {
            let reply = envelope.reply(200, self.status(membership));
            self.post(reply, envelope.reply_destination());
            return Ok(());
        }

        let mut request = envelope.clone();
        self.registry.adapt_input(&mut request)?;
        let Some(dataset) = request.dataset.clone() else {
            return errinput!("missing dataset");
        };
        catalog.dataset(&dataset)?;

        let steps = self.registry.plan(&request)?;
        let plan = ExecutionPlanner::new(catalog, membership, &self.my_name).plan(&dataset, steps)?;
        self.dispatch(request, plan)
    }

    /// Dispatches a routed plan under a fresh execution id: one internal
    /// envelope per distinct destination node, plus this node's own session.
    fn dispatch(&mut self, request: Envelope, plan: Plan) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        debug!("Dispatching session {id} for {} request", request.kind);

        let mut destinations: Vec<Address> = Vec::new();
        for route in plan.steps.iter().flat_map(|step| &step.routes) {
            if !destinations.iter().any(|node| node.same_node(route)) {
                destinations.push(route.node());
            }
        }

        let dispatch =
            Dispatch { id: id.clone(), steps: plan.steps, timeout_seconds: plan.timeout_seconds };
        let body = serde_json::to_value(&dispatch)?;
        for destination in destinations {
            if destination.same_node(&self.my_name) {
                continue;
            }
            self.outbox.send((Envelope::internal(body.clone()), destination))?;
        }

        self.pending.insert(id, request);
        self.accept_dispatch(dispatch)
    }

    fn process_internal(&mut self, envelope: &Envelope) -> Result<()> {
        match serde_json::from_value(envelope.body.clone())? {
            Internal::Dispatch(dispatch) => self.accept_dispatch(dispatch),
            Internal::Deliver(deliver) => self.accept_delivery(deliver),
        }
    }

    /// Registers the session for a dispatched plan and kicks it off. Every
    /// receiving engine resolves the delivery bookkeeping identically from
    /// the shared step list, so only the routed steps travel.
    fn accept_dispatch(&mut self, dispatch: Dispatch) -> Result<()> {
        if self.sessions.contains_key(&dispatch.id) {
            warn!("Ignoring duplicate dispatch for session {}", dispatch.id);
            return Ok(());
        }
        let Dispatch { id, mut steps, timeout_seconds } = dispatch;
        resolve_descendants(&mut steps);
        let timeout = timeout_seconds
            .map(|seconds| seconds.saturating_mul(TICKS_PER_SECOND))
            .unwrap_or(self.default_timeout);
        let mut session =
            Session::new(id.clone(), &self.my_name, steps, self.now.saturating_add(timeout));
        let effects = session.start();
        self.sessions.insert(id.clone(), session);
        self.run_effects(&id, effects)?;
        self.remove_if_done(&id);
        Ok(())
    }

    /// Routes one delivered partial result into its session. Results for
    /// unknown sessions, typically stragglers arriving after a timeout, are
    /// dropped.
    fn accept_delivery(&mut self, deliver: Deliver) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&deliver.id) else {
            warn!("Dropping orphan result {} for session {}", deliver.input, deliver.id);
            return Ok(());
        };
        let effects = session.receive(&deliver.input, &deliver.value, &self.registry)?;
        self.run_effects(&deliver.id, effects)?;
        self.remove_if_done(&deliver.id);
        Ok(())
    }

    /// Carries out session effects, including the cascade they trigger:
    /// executing a leaf task produces deliveries, a local delivery can
    /// complete further tasks, and so on until the queue drains.
    fn run_effects(&mut self, id: &str, effects: Vec<Effect>) -> Result<()> {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Execute { task } => {
                    let Some(session) = self.sessions.get_mut(id) else { continue };
                    let (step, route) = session.task(task);
                    let values = match self.registry.handle(step, route) {
                        Ok(result) => success_values(step, result),
                        Err(error) => {
                            error!("Executing {} for session {id} failed: {error}", step.kind);
                            error_values(step, &self.my_name, &error)
                        }
                    };
                    queue.extend(session.complete(task, values));
                }
                Effect::Deliver { input, value, routes } => {
                    for route in routes {
                        if route.same_node(&self.my_name) {
                            let Some(session) = self.sessions.get_mut(id) else { continue };
                            queue.extend(session.receive(&input, &value, &self.registry)?);
                        } else {
                            let deliver = Deliver {
                                id: id.to_owned(),
                                input: input.clone(),
                                value: value.clone(),
                            };
                            let envelope = Envelope::internal(serde_json::to_value(&deliver)?);
                            self.outbox.send((envelope, route))?;
                        }
                    }
                }
                Effect::Post { values } => self.post_result(id, values),
            }
        }
        Ok(())
    }

    /// Resolves the pending reply for an execution that posted its result.
    /// A non-empty gathered error channel promotes the first error's status
    /// and body to the reply; the rest only make the log.
    fn post_result(&mut self, id: &str, values: Json) {
        let Some(request) = self.pending.remove(id) else {
            warn!("No pending request for session {id}, dropping result");
            return;
        };
        let (status_code, body) = promote_errors(id, values);
        let mut reply = request.reply(status_code, body);
        if let Err(error) = self.registry.adapt_output(&mut reply) {
            error!("Output adapter failed for session {id}: {error}");
        }
        self.post(reply, request.reply_destination());
    }

    /// Queues a reply envelope, or drops it when the request named no reply
    /// address. Dropped error replies are logged as orphans.
    fn post(&self, reply: Envelope, destination: Option<Address>) {
        let Some(destination) = destination else {
            let status_code = reply.status_code.unwrap_or(200);
            if status_code != 200 {
                warn!("Orphan {status_code} reply to {} request", reply.kind);
            }
            return;
        };
        if let Err(error) = self.outbox.send((reply, destination)) {
            error!("Failed to queue reply: {error}");
        }
    }

    /// Drops a session once every local task has completed.
    fn remove_if_done(&mut self, id: &str) {
        if self.sessions.get(id).is_some_and(Session::done) {
            debug!("Session {id} done");
            self.sessions.remove(id);
        }
    }

    /// The status body: this node's identity, role, and live session count,
    /// plus every known node's derived routing state.
    fn status(&self, membership: &Membership) -> Json {
        let mut nodes = serde_json::Map::new();
        for node in membership.nodes() {
            nodes.insert(
                node.name.to_string(),
                json!({
                    "role": node.state.role,
                    "live": node.state.live,
                    "forwardable": node.forwardable,
                    "writable": node.writable,
                    "readable": node.readable,
                }),
            );
        }
        json!({
            "name": self.my_name.to_string(),
            "role": membership.my_role(),
            "sessions": self.sessions.len(),
            "nodes": nodes,
        })
    }
}

/// The output values of a successfully executed command: the result under
/// every declared output, with an empty error channel.
fn success_values(step: &Step, result: Json) -> Values {
    let mut values = Values::new();
    for output in &step.outputs {
        if output == ERRORS {
            values.insert(output.clone(), json!({}));
        } else {
            values.insert(output.clone(), result.clone());
        }
    }
    values
}

/// The output values of a failed command: the error channel carries the
/// failure keyed by this node, and the other outputs deliver null so that
/// downstream expectations still come due.
fn error_values(step: &Step, node: &Address, error: &Error) -> Values {
    let mut values = Values::new();
    for output in &step.outputs {
        if output == ERRORS {
            let mut failures = serde_json::Map::new();
            failures.insert(
                node.to_string(),
                json!({"statusCode": error.status_code(), "body": error.to_string()}),
            );
            values.insert(output.clone(), Json::Object(failures));
        } else {
            values.insert(output.clone(), Json::Null);
        }
    }
    values
}

/// Strips the gathered error channel from posted values. When it is
/// non-empty, the first error (by node order) becomes the whole reply and
/// the others are logged; multiple distinct failures surface only one.
fn promote_errors(id: &str, mut values: Json) -> (u16, Json) {
    let Some(errors) = values.as_object_mut().and_then(|body| body.remove(ERRORS)) else {
        return (200, values);
    };
    let Some(errors) = errors.as_object().filter(|errors| !errors.is_empty()) else {
        return (200, values);
    };
    for (node, error) in errors {
        warn!("Session {id} failed on {node}: {error}");
    }
    let Some(first) = errors.values().next() else {
        return (200, values);
    };
    let status_code = first.get("statusCode").and_then(Json::as_u64).unwrap_or(500) as u16;
    let body = first.get("body").cloned().unwrap_or(Json::Null);
    (status_code, body)
}

/// The reply body for a failed request. Internal failures surface no
/// detail; the log has it.
fn reply_body(error: &Error) -> Json {
    match error {
        Error::Internal(_) | Error::Plan(_) | Error::IO(_) => {
            json!({"error": "internal server error"})
        }
        error => json!({"error": error.to_string()}),
    }
}
