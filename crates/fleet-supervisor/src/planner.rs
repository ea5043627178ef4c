//! Planner: derives the operations for one tick.
//!
//! Pure: the same snapshot, deployment, overrides, timeouts and `now`
//! always produce the same list. Rules run per routing group in a fixed
//! order and look only at the group's input membership, never at the
//! effect of operations emitted earlier in the same pass.

use std::collections::{BTreeMap, HashMap};

use fleet_state::{Deployment, Node, NodeConfigOverride, NodeState, NodesByState, RoutingId};

use crate::config::StateTimeouts;
use crate::operation::{FailReason, Operation};

/// Plan every routing group in `groups` against `deployment`.
///
/// Groups are visited in routing id order and nodes within a state in id
/// order.
pub fn plan(
    deployment: &Deployment,
    groups: &BTreeMap<RoutingId, NodesByState>,
    overrides: &HashMap<RoutingId, NodeConfigOverride>,
    timeouts: &StateTimeouts,
    now: u64,
) -> Vec<Operation> {
    let mut ops = Vec::new();
    for (routing_id, nodes) in groups {
        plan_group(
            routing_id,
            nodes,
            deployment,
            overrides.get(routing_id),
            timeouts,
            now,
            &mut ops,
        );
    }
    ops
}

fn plan_group(
    routing_id: &str,
    nodes: &NodesByState,
    deployment: &Deployment,
    config_override: Option<&NodeConfigOverride>,
    timeouts: &StateTimeouts,
    now: u64,
    ops: &mut Vec<Operation>,
) {
    let timed_out = |node: &&Node| timeouts.is_timed_out(node, now);

    // 1. Start everything pending.
    for node in nodes.get(NodeState::Pending) {
        ops.push(Operation::Start { node: node.clone() });
    }

    // 1b. Pending for too long: the provider never picked it up.
    for node in nodes.get(NodeState::Pending).iter().filter(timed_out) {
        ops.push(Operation::Fail {
            node: node.clone(),
            reason: FailReason::PendingTimeout,
        });
    }

    // 2. Stuck while starting.
    for node in nodes.get(NodeState::Starting).iter().filter(timed_out) {
        ops.push(Operation::Fail {
            node: node.clone(),
            reason: FailReason::StartingTimeout,
        });
    }

    // 3. Running on a stale deployment or a stale spec.
    for node in nodes.get(NodeState::Running) {
        let stale_deployment = node.deployment_id != deployment.id;
        let stale_spec = config_override.is_some_and(|ov| ov.differs_from(node));
        if stale_deployment || stale_spec {
            ops.push(Operation::Outdate { node: node.clone() });
        }
    }

    // 4 and 5 are mutually exclusive: drain once a replacement serves,
    // otherwise ask for exactly one replacement.
    let outdated = nodes.get(NodeState::Outdated);
    let running = nodes.count(NodeState::Running);
    if running > 0 {
        for node in outdated {
            ops.push(Operation::Finishing { node: node.clone() });
        }
    } else if !outdated.is_empty()
        && nodes.count(NodeState::Starting) == 0
        && nodes.count(NodeState::Pending) == 0
    {
        ops.push(Operation::Create {
            routing_id: routing_id.to_string(),
            deployment: deployment.clone(),
        });
    }

    // 6. Drain running long.
    for node in nodes.get(NodeState::Finishing).iter().filter(timed_out) {
        ops.push(Operation::FinishingTimeout { node: node.clone() });
    }

    // 7. Release idle compute.
    for node in nodes.get(NodeState::Idle) {
        ops.push(Operation::Terminate { node: node.clone() });
    }

    // 7b. Idle for too long: terminate keeps failing.
    for node in nodes.get(NodeState::Idle).iter().filter(timed_out) {
        ops.push(Operation::Fail {
            node: node.clone(),
            reason: FailReason::IdleTimeout,
        });
    }

    // 8 and 9. Retention.
    for state in [NodeState::Terminated, NodeState::Error] {
        for node in nodes.get(state).iter().filter(timed_out) {
            ops.push(Operation::Remove { node: node.clone() });
        }
    }
}
