//! Operations emitted by the planner and applied by the executor.

use std::fmt;

use fleet_state::{Deployment, Node, NodeId, RoutingId};

/// Why a node is being failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    PendingTimeout,
    StartingTimeout,
    IdleTimeout,
    /// Provider rejected a start or terminate.
    Provider(String),
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::PendingTimeout => f.write_str("pending_timeout_reached"),
            FailReason::StartingTimeout => f.write_str("starting_timeout_reached"),
            FailReason::IdleTimeout => f.write_str("idle_timeout_reached"),
            FailReason::Provider(message) => f.write_str(message),
        }
    }
}

/// One step toward the desired fleet state.
///
/// Node-carrying variants hold the snapshot the planner saw. The executor
/// acts on the id; the store rejects the step if the node moved on since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Provision a replacement node for `routing_id` on `deployment`.
    Create {
        routing_id: RoutingId,
        deployment: Deployment,
    },
    Start {
        node: Node,
    },
    Fail {
        node: Node,
        reason: FailReason,
    },
    Outdate {
        node: Node,
    },
    /// Ask the node to drain, then mark it FINISHING.
    Finishing {
        node: Node,
    },
    /// A drain has run past its timeout.
    FinishingTimeout {
        node: Node,
    },
    Terminate {
        node: Node,
    },
    /// Hard-delete a TERMINATED or ERROR record.
    Remove {
        node: Node,
    },
}

impl Operation {
    /// Short name used in logs and spans.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "CREATE",
            Operation::Start { .. } => "START",
            Operation::Fail { .. } => "FAIL",
            Operation::Outdate { .. } => "OUTDATE",
            Operation::Finishing { .. } => "FINISHING",
            Operation::FinishingTimeout { .. } => "FINISHING_TIMEOUT",
            Operation::Terminate { .. } => "TERMINATE",
            Operation::Remove { .. } => "REMOVE",
        }
    }

    /// Target node, for every variant except `Create`.
    pub fn node(&self) -> Option<&Node> {
        match self {
            Operation::Create { .. } => None,
            Operation::Start { node }
            | Operation::Fail { node, .. }
            | Operation::Outdate { node }
            | Operation::Finishing { node }
            | Operation::FinishingTimeout { node }
            | Operation::Terminate { node }
            | Operation::Remove { node } => Some(node),
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node().map(|node| node.id)
    }

    pub fn routing_id(&self) -> &str {
        match self {
            Operation::Create { routing_id, .. } => routing_id,
            other => other
                .node()
                .map(|node| node.routing_id.as_str())
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create {
                routing_id,
                deployment,
            } => write!(f, "CREATE {routing_id} on deployment {}", deployment.id),
            Operation::Fail { node, reason } => write!(f, "FAIL node {} ({reason})", node.id),
            other => write!(f, "{} node {}", other.kind(), other.node_id().unwrap_or_default()),
        }
    }
}
