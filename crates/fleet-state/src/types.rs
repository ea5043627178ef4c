//! Domain types for the fleet state store.
//!
//! These types represent the persisted state of nodes, deployments,
//! config overrides and leases. All types are serializable to/from JSON
//! for storage in redb tables.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Store-assigned node identifier.
pub type NodeId = u64;

/// Store-assigned deployment identifier.
pub type DeploymentId = u64;

/// Logical group a node serves. Stable across node replacements.
pub type RoutingId = String;

// ── Node state ────────────────────────────────────────────────────

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Starting,
    Running,
    Outdated,
    Finishing,
    Idle,
    Terminated,
    Error,
}

impl NodeState {
    /// Every state, in lifecycle order.
    pub const ALL: [NodeState; 8] = [
        NodeState::Pending,
        NodeState::Starting,
        NodeState::Running,
        NodeState::Outdated,
        NodeState::Finishing,
        NodeState::Idle,
        NodeState::Terminated,
        NodeState::Error,
    ];

    /// Whether `self -> to` is an accepted lifecycle transition.
    pub fn can_transition_to(self, to: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, to),
            (Pending, Starting)
                | (Pending, Error)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Outdated)
                | (Running, Error)
                | (Running, Idle)
                | (Outdated, Finishing)
                | (Outdated, Error)
                | (Finishing, Idle)
                | (Finishing, Error)
                | (Idle, Terminated)
                | (Idle, Error)
        )
    }

    /// Only nodes in a terminal state may be hard-deleted.
    pub fn is_removable(self) -> bool {
        matches!(self, NodeState::Terminated | NodeState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Pending => "PENDING",
            NodeState::Starting => "STARTING",
            NodeState::Running => "RUNNING",
            NodeState::Outdated => "OUTDATED",
            NodeState::Finishing => "FINISHING",
            NodeState::Idle => "IDLE",
            NodeState::Terminated => "TERMINATED",
            NodeState::Error => "ERROR",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown node state: {s}"))
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// A unit of provisioned compute tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub routing_id: RoutingId,
    pub deployment_id: DeploymentId,
    /// Reachable address, set when the node registers as RUNNING.
    pub url: Option<String>,
    pub state: NodeState,
    pub image: String,
    pub cpu_milli: u32,
    pub memory_mb: u32,
    pub storage_mb: u32,
    /// Failure reason, set on ERROR.
    pub error: Option<String>,
    /// Unix timestamp (milliseconds) when the record was created.
    pub created_at: u64,
    /// Unix timestamp (milliseconds) of the last state change.
    pub last_state_transition_at: u64,
}

impl Node {
    /// The provisioning spec this node was created with.
    pub fn config(&self) -> NodeConfig {
        NodeConfig {
            image: self.image.clone(),
            cpu_milli: self.cpu_milli,
            memory_mb: self.memory_mb,
            storage_mb: self.storage_mb,
        }
    }

    /// Milliseconds spent in the current state as of `now`.
    pub fn time_in_state(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_state_transition_at)
    }
}

/// Provisioning request for a new node. The store assigns id, state and
/// timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewNode {
    pub routing_id: RoutingId,
    pub deployment_id: DeploymentId,
    pub config: NodeConfig,
}

/// Compute spec of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    pub image: String,
    pub cpu_milli: u32,
    pub memory_mb: u32,
    pub storage_mb: u32,
}

/// Requested state change for [`crate::StateStore::transition_to`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Move to a state that carries no extra data.
    To(NodeState),
    /// STARTING -> RUNNING, recording where the node can be reached.
    Register { url: String },
    /// Any active state -> ERROR, recording why.
    Fail { reason: String },
}

impl Transition {
    pub fn target(&self) -> NodeState {
        match self {
            Transition::To(state) => *state,
            Transition::Register { .. } => NodeState::Running,
            Transition::Fail { .. } => NodeState::Error,
        }
    }
}

// ── Search ────────────────────────────────────────────────────────

/// Default page size for node searches.
pub const DEFAULT_SEARCH_LIMIT: usize = 1000;

/// Node search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSearch {
    pub states: Vec<NodeState>,
    pub routing_id: Option<RoutingId>,
    /// First node id to include (inclusive).
    pub cursor: Option<NodeId>,
    pub limit: usize,
}

impl NodeSearch {
    pub fn new(states: impl Into<Vec<NodeState>>) -> Self {
        Self {
            states: states.into(),
            routing_id: None,
            cursor: None,
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    pub fn all_states() -> Self {
        Self::new(NodeState::ALL.to_vec())
    }

    pub fn with_routing_id(mut self, routing_id: impl Into<RoutingId>) -> Self {
        self.routing_id = Some(routing_id.into());
        self
    }

    pub fn with_cursor(mut self, cursor: Option<NodeId>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub(crate) fn matches(&self, node: &Node) -> bool {
        self.states.contains(&node.state)
            && self
                .routing_id
                .as_ref()
                .is_none_or(|routing_id| *routing_id == node.routing_id)
    }
}

/// Nodes of one routing group, bucketed by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodesByState(HashMap<NodeState, Vec<Node>>);

impl NodesByState {
    pub fn push(&mut self, node: Node) {
        self.0.entry(node.state).or_default().push(node);
    }

    /// Nodes in `state`, in id order.
    pub fn get(&self, state: NodeState) -> &[Node] {
        self.0.get(&state).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.get(state).len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Fold another bucket set for the same routing group into this one.
    pub fn merge(&mut self, other: NodesByState) {
        for (state, nodes) in other.0 {
            self.0.entry(state).or_default().extend(nodes);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        NodeState::ALL.into_iter().flat_map(|state| self.get(state))
    }
}

/// One page of node search results, grouped by routing id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSearchPage {
    pub nodes: BTreeMap<RoutingId, NodesByState>,
    /// Id to resume from, present iff more matching nodes exist.
    pub next_cursor: Option<NodeId>,
}

// ── Deployment ────────────────────────────────────────────────────

/// An immutable, versioned release. Exactly one is active at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub commit_id: String,
    /// Image new nodes are created with unless overridden.
    pub image: String,
    /// Unix timestamp (milliseconds).
    pub created_at: u64,
    /// Set once a newer deployment is activated.
    pub superseded_at: Option<u64>,
}

// ── Config override ───────────────────────────────────────────────

/// Per-routing-group replacement for parts of the default node spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfigOverride {
    pub routing_id: RoutingId,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub cpu_milli: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub storage_mb: Option<u32>,
    /// Unix timestamp (milliseconds) of the last upsert.
    #[serde(default)]
    pub updated_at: u64,
}

impl NodeConfigOverride {
    /// Replace each overridden field of `config`.
    pub fn apply(&self, mut config: NodeConfig) -> NodeConfig {
        if let Some(image) = &self.image {
            config.image = image.clone();
        }
        if let Some(cpu_milli) = self.cpu_milli {
            config.cpu_milli = cpu_milli;
        }
        if let Some(memory_mb) = self.memory_mb {
            config.memory_mb = memory_mb;
        }
        if let Some(storage_mb) = self.storage_mb {
            config.storage_mb = storage_mb;
        }
        config
    }

    /// Whether any overridden field disagrees with what `node` runs.
    pub fn differs_from(&self, node: &Node) -> bool {
        self.image.as_ref().is_some_and(|image| *image != node.image)
            || self.cpu_milli.is_some_and(|cpu| cpu != node.cpu_milli)
            || self.memory_mb.is_some_and(|mem| mem != node.memory_mb)
            || self.storage_mb.is_some_and(|storage| storage != node.storage_mb)
    }
}

// ── Lease ─────────────────────────────────────────────────────────

/// Time-bounded ownership of a named lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub owner: String,
    /// Unix timestamp (milliseconds) after which the lease is free.
    pub expires_at: u64,
}

impl Lease {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}
