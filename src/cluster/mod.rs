//! Cluster membership and message forwarding.
//!
//! The engine learns about its peers from a cluster-state file maintained by
//! the membership layer (outside this crate): a JSON map of node name to
//! role, liveness, and absorption progress. The file is polled and reloaded
//! wholesale; each reload derives per-node routing properties relative to our
//! own role and compares the derived set against the previous one, so
//! subscribers only hear about real changes.
//!
//! Messages for nodes that can't accept them right now are spooled to a
//! durable per-destination queue (buffer) and replayed in arrival order once
//! the destination becomes deliverable again (forward).

pub mod buffer;
pub mod forward;
pub mod node;

pub use buffer::ForwardBuffer;
pub use forward::{ChannelTransport, Forwarder, TcpTransport, Transport};
pub use node::{Node, NodeState, Role};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use log::{info, warn};
use time::OffsetDateTime;

use crate::error::Result;
use crate::message::Address;

/// A membership change subscriber, invoked with the new derived node set.
pub type Subscriber = Box<dyn FnMut(&[Node]) + Send>;

/// The cluster membership view: every known node with derived routing
/// properties, recomputed on every reload.
pub struct Membership {
    /// Our own node address.
    my_name: Address,
    /// The cluster-state file.
    path: PathBuf,
    /// Our own role, read from our entry in the state file.
    my_role: Role,
    /// Raw node states from the last successful read.
    states: BTreeMap<Address, NodeState>,
    /// Derived nodes, rebuilt whenever states or buffered destinations
    /// change.
    nodes: BTreeMap<Address, Node>,
    /// Destinations we currently hold buffered messages for.
    buffered: BTreeSet<Address>,
    /// Change subscribers.
    subscribers: Vec<Subscriber>,
}

impl Membership {
    /// Creates a membership view reading from the given cluster-state file,
    /// and performs the initial load.
    pub fn load(my_name: Address, path: impl Into<PathBuf>) -> Self {
        let mut membership = Self {
            my_name: my_name.node(),
            path: path.into(),
            my_role: Role::default(),
            states: BTreeMap::new(),
            nodes: BTreeMap::new(),
            buffered: BTreeSet::new(),
            subscribers: Vec::new(),
        };
        membership.reload();
        membership
    }

    /// Registers a change subscriber. It fires only when the derived node
    /// set actually differs from the previous one.
    pub fn subscribe(&mut self, subscriber: Subscriber) {
        self.subscribers.push(subscriber);
    }

    /// Re-reads the cluster-state file and recomputes all derived state.
    /// Returns true if the derived node set changed. A missing or malformed
    /// file is treated as an empty cluster, not as a fatal error.
    pub fn reload(&mut self) -> bool {
        self.states = match Self::read_states(&self.path) {
            Ok(states) => states,
            Err(err) => {
                warn!(
                    "Treating cluster state {} as empty: {err}",
                    self.path.display()
                );
                BTreeMap::new()
            }
        };
        self.my_role =
            self.states.get(&self.my_name).map(|state| state.role).unwrap_or_default();
        self.rederive()
    }

    /// Reads and parses the cluster-state file.
    fn read_states(path: &Path) -> Result<BTreeMap<Address, NodeState>> {
        let raw = std::fs::read_to_string(path)?;
        let states: BTreeMap<String, NodeState> = serde_json::from_str(&raw)?;
        states.into_iter().map(|(name, state)| Ok((Address::parse(&name)?, state))).collect()
    }

    /// Marks whether we hold buffered messages for a destination, which
    /// affects its readability. Returns true if the derived set changed.
    pub fn set_buffered(&mut self, destination: &Address, buffered: bool) -> bool {
        let destination = destination.node();
        let changed =
            if buffered { self.buffered.insert(destination) } else { self.buffered.remove(&destination) };
        if !changed {
            return false;
        }
        self.rederive()
    }

    /// Rebuilds the derived node set and notifies subscribers if it differs
    /// from the previous one.
    fn rederive(&mut self) -> bool {
        let nodes: BTreeMap<Address, Node> = self
            .states
            .iter()
            .map(|(name, state)| {
                let buffered = self.buffered.contains(name);
                (
                    name.clone(),
                    Node::derive(name.clone(), state.clone(), self.my_role, buffered),
                )
            })
            .collect();
        if nodes == self.nodes {
            return false;
        }
        self.nodes = nodes;
        info!(
            "Cluster membership changed: {} node(s), {} forwardable, {} writable, {} readable",
            self.nodes.len(),
            self.forwardable_nodes().len(),
            self.writable_nodes().len(),
            self.readable_nodes().len(),
        );
        let snapshot: Vec<Node> = self.nodes.values().cloned().collect();
        for subscriber in &mut self.subscribers {
            subscriber(&snapshot);
        }
        true
    }

    /// Our own node address.
    pub fn my_name(&self) -> &Address {
        &self.my_name
    }

    /// Our own role.
    pub fn my_role(&self) -> Role {
        self.my_role
    }

    /// Returns true if the address names this engine.
    pub fn is_self(&self, address: &Address) -> bool {
        address.same_node(&self.my_name)
    }

    /// Looks up a node by address (shard-local suffixes are ignored).
    pub fn node(&self, address: &Address) -> Option<&Node> {
        self.nodes.get(&address.node())
    }

    /// All known nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Nodes general forwarding is allowed to.
    pub fn forwardable_nodes(&self) -> Vec<Address> {
        self.nodes.values().filter(|n| n.forwardable).map(|n| n.name.clone()).collect()
    }

    /// Valid write targets from our role.
    pub fn writable_nodes(&self) -> Vec<Address> {
        self.nodes.values().filter(|n| n.writable).map(|n| n.name.clone()).collect()
    }

    /// Nodes that can serve reads right now.
    pub fn readable_nodes(&self) -> Vec<Address> {
        self.nodes.values().filter(|n| n.readable).map(|n| n.name.clone()).collect()
    }

    /// Returns true if messages can be delivered to the address right now.
    /// Nodes absent from the cluster state are assumed deliverable: the
    /// catalog decides what exists, the cluster state only downgrades
    /// health.
    pub fn deliverable(&self, address: &Address) -> bool {
        self.node(address).map(|n| n.deliverable()).unwrap_or(true)
    }

    /// The replay boundary for a destination, if its cluster-state entry
    /// declares one.
    pub fn boundary(&self, address: &Address) -> Option<OffsetDateTime> {
        self.node(address).and_then(|n| n.state.accept_messages_newer_than)
    }
}
