//! redb table definitions for the fleet state store.
//!
//! Values are JSON-serialized domain types. Nodes and deployments use their
//! numeric id as key so range scans come back in creation order.

use redb::TableDefinition;

/// Node records keyed by store-assigned id.
pub const NODES: TableDefinition<u64, &[u8]> = TableDefinition::new("nodes");

/// Deployments keyed by id.
pub const DEPLOYMENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("deployments");

/// Per-routing-group node config overrides keyed by `{routing_id}`.
pub const CONFIG_OVERRIDES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("node_config_overrides");

/// Leases keyed by lock name.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

/// Counters and pointers: id sequences and the active deployment.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key of the next node id in [`META`].
pub const META_NEXT_NODE_ID: &str = "next_node_id";

/// Key of the next deployment id in [`META`].
pub const META_NEXT_DEPLOYMENT_ID: &str = "next_deployment_id";

/// Key of the active deployment id in [`META`].
pub const META_ACTIVE_DEPLOYMENT: &str = "active_deployment";
