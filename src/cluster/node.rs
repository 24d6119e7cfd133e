use serde_derive::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::message::Address;

/// A cluster node's role. Service providers serve queries; absorb sources and
/// destinations are the two ends of a data-absorption (migration) flow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[default]
    #[serde(rename = "service-provider")]
    ServiceProvider,
    #[serde(rename = "absorb-source")]
    AbsorbSource,
    #[serde(rename = "absorb-destination")]
    AbsorbDestination,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::ServiceProvider => "service-provider",
            Role::AbsorbSource => "absorb-source",
            Role::AbsorbDestination => "absorb-destination",
        })
    }
}

/// A node's raw state as read from the cluster-state file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// The node's role.
    #[serde(default)]
    pub role: Role,
    /// Whether the node is alive per the membership layer.
    #[serde(default)]
    pub live: bool,
    /// Whether the node still has buffered messages to work through before
    /// its data is complete.
    #[serde(default)]
    pub have_unprocessed_messages: bool,
    /// The replay boundary: buffered messages dated at or before this are
    /// obsolete and must not be re-delivered when the node comes back.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub accept_messages_newer_than: Option<OffsetDateTime>,
}

/// A cluster node with its derived routing properties. Derivation depends on
/// this engine's own role ("my role"), so the same state file yields
/// different views on nodes in different roles.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// The node address (host:port/tag, no shard-local part).
    pub name: Address,
    /// The raw state from the cluster-state file.
    pub state: NodeState,
    /// Whether general message forwarding to this node is allowed: it is
    /// live and plays the same role we do.
    pub forwardable: bool,
    /// Whether this node is a valid write target from our role. Writes never
    /// cross roles except along the designated absorption path.
    pub writable: bool,
    /// Whether this node can serve reads: forwardable, with no buffered
    /// backlog from us and no unprocessed messages of its own while acting
    /// as a service provider.
    pub readable: bool,
}

impl Node {
    /// Derives a node's routing properties from its raw state, our own role,
    /// and whether we hold buffered messages for it.
    pub fn derive(name: Address, state: NodeState, my_role: Role, buffered: bool) -> Self {
        let forwardable = state.live && state.role == my_role;
        let writable = match state.role {
            Role::ServiceProvider => true,
            Role::AbsorbSource => my_role == Role::AbsorbSource,
            Role::AbsorbDestination => my_role == Role::AbsorbDestination,
        };
        let complete = state.role != Role::ServiceProvider || !state.have_unprocessed_messages;
        let readable = forwardable && !buffered && complete;
        Self { name, state, forwardable, writable, readable }
    }

    /// Returns true if messages can be delivered to this node right now.
    /// Undeliverable targets get their messages buffered for later replay.
    pub fn deliverable(&self) -> bool {
        self.state.live && self.writable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(name: &str) -> Address {
        Address::parse(&format!("{name}:10031/engine")).unwrap()
    }

    fn state(role: Role, live: bool) -> NodeState {
        NodeState { role, live, ..NodeState::default() }
    }

    #[test]
    fn forwardable_requires_liveness_and_matching_role() {
        let node = Node::derive(
            address("n1"),
            state(Role::ServiceProvider, true),
            Role::ServiceProvider,
            false,
        );
        assert!(node.forwardable);

        let dead = Node::derive(
            address("n1"),
            state(Role::ServiceProvider, false),
            Role::ServiceProvider,
            false,
        );
        assert!(!dead.forwardable);

        let cross = Node::derive(
            address("n1"),
            state(Role::AbsorbSource, true),
            Role::ServiceProvider,
            false,
        );
        assert!(!cross.forwardable);
    }

    #[test]
    fn writability_follows_the_role_table() {
        // Service providers are writable targets from any role.
        for my_role in [Role::ServiceProvider, Role::AbsorbSource, Role::AbsorbDestination] {
            let node =
                Node::derive(address("n1"), state(Role::ServiceProvider, true), my_role, false);
            assert!(node.writable, "service-provider target from {my_role}");
        }
        // Absorb endpoints only accept writes from their own kind.
        let node = Node::derive(
            address("n1"),
            state(Role::AbsorbSource, true),
            Role::AbsorbSource,
            false,
        );
        assert!(node.writable);
        let node = Node::derive(
            address("n1"),
            state(Role::AbsorbSource, true),
            Role::ServiceProvider,
            false,
        );
        assert!(!node.writable);
        let node = Node::derive(
            address("n1"),
            state(Role::AbsorbDestination, true),
            Role::AbsorbSource,
            false,
        );
        assert!(!node.writable);
    }

    #[test]
    fn readability_requires_empty_buffers_and_complete_providers() {
        let mut node_state = state(Role::ServiceProvider, true);
        let node =
            Node::derive(address("n1"), node_state.clone(), Role::ServiceProvider, false);
        assert!(node.readable);

        // A buffered backlog from us blocks reads.
        let node = Node::derive(address("n1"), node_state.clone(), Role::ServiceProvider, true);
        assert!(!node.readable);

        // A provider mid-absorption with unprocessed messages is not yet
        // readable.
        node_state.have_unprocessed_messages = true;
        let node = Node::derive(address("n1"), node_state, Role::ServiceProvider, false);
        assert!(!node.readable);

        // Non-providers are exempt from the completeness requirement.
        let mut absorb = state(Role::AbsorbSource, true);
        absorb.have_unprocessed_messages = true;
        let node = Node::derive(address("n1"), absorb, Role::AbsorbSource, false);
        assert!(node.readable);
    }

    #[test]
    fn deliverability_requires_liveness() {
        let node = Node::derive(
            address("n1"),
            state(Role::ServiceProvider, false),
            Role::ServiceProvider,
            false,
        );
        assert!(node.writable, "role allows writes");
        assert!(!node.deliverable(), "but a dead node buffers instead");
    }
}
