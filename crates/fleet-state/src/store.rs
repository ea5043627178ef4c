//! StateStore: redb-backed persistence for the fleet.
//!
//! Provides typed operations over nodes, deployments, config overrides and
//! leases. All values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(CONFIG_OVERRIDES).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Bump and return the sequence stored under `key` (starting at 1).
    fn next_id(txn: &WriteTransaction, key: &str) -> StateResult<u64> {
        let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
        let id = meta
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(1);
        meta.insert(key, id + 1).map_err(map_err!(Write))?;
        Ok(id)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert a new node in PENDING.
    pub fn create_node(&self, new_node: &NewNode) -> StateResult<Node> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = Self::next_id(&txn, META_NEXT_NODE_ID)?;
        let node = Node {
            id,
            routing_id: new_node.routing_id.clone(),
            deployment_id: new_node.deployment_id,
            url: None,
            state: NodeState::Pending,
            image: new_node.config.image.clone(),
            cpu_milli: new_node.config.cpu_milli,
            memory_mb: new_node.config.memory_mb,
            storage_mb: new_node.config.storage_mb,
            error: None,
            created_at: now,
            last_state_transition_at: now,
        };
        let value = serde_json::to_vec(&node).map_err(map_err!(Serialize))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node_id = id, routing_id = %node.routing_id, "node created");
        Ok(node)
    }

    /// Insert or replace a node record verbatim.
    ///
    /// Skips transition validation and leaves the id sequence alone unless
    /// the record's id is past it. Meant for seeding and repair tooling.
    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let next = meta
                .get(META_NEXT_NODE_ID)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(1);
            if node.id >= next {
                meta.insert(META_NEXT_NODE_ID, node.id + 1)
                    .map_err(map_err!(Write))?;
            }
        }
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(node.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a node by id.
    pub fn get_node(&self, id: NodeId) -> StateResult<Node> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Err(StateError::NodeNotFound(id)),
        }
    }

    /// Search nodes by state (and optionally routing id), one page at a time.
    ///
    /// Results are in id order. `next_cursor` is the id of the first match
    /// past this page.
    pub fn search_nodes(&self, search: &NodeSearch) -> StateResult<NodeSearchPage> {
        let limit = search.limit.max(1);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;

        let mut page = NodeSearchPage::default();
        let mut taken = 0usize;
        for entry in table
            .range(search.cursor.unwrap_or(0)..)
            .map_err(map_err!(Read))?
        {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let node: Node =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if !search.matches(&node) {
                continue;
            }
            if taken == limit {
                page.next_cursor = Some(key.value());
                break;
            }
            taken += 1;
            page.nodes
                .entry(node.routing_id.clone())
                .or_insert_with(NodesByState::default)
                .push(node);
        }
        Ok(page)
    }

    /// Move a node to a new state after validating the transition.
    ///
    /// Read, validation and write happen in one write transaction. Rejected
    /// transitions leave the record untouched.
    pub fn transition_to(&self, id: NodeId, transition: Transition) -> StateResult<Node> {
        let to = transition.target();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node = {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut node: Node = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NodeNotFound(id)),
            };

            let from = node.state;
            if !from.can_transition_to(to) {
                return Err(StateError::InvalidTransition { from, to });
            }

            node.state = to;
            node.last_state_transition_at = epoch_millis().max(node.last_state_transition_at + 1);
            match transition {
                Transition::To(_) => {}
                Transition::Register { url } => node.url = Some(url),
                Transition::Fail { reason } => node.error = Some(reason),
            }

            let value = serde_json::to_vec(&node).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            node
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node_id = id, state = %to, "node transitioned");
        Ok(node)
    }

    /// Move a node to ERROR, recording `reason`.
    pub fn fail_node(&self, id: NodeId, reason: impl Into<String>) -> StateResult<Node> {
        self.transition_to(
            id,
            Transition::Fail {
                reason: reason.into(),
            },
        )
    }

    /// Mark a STARTING node as RUNNING at `url`.
    pub fn register_node(&self, id: NodeId, url: impl Into<String>) -> StateResult<Node> {
        self.transition_to(id, Transition::Register { url: url.into() })
    }

    /// Mark a node as IDLE (drained).
    pub fn idle_node(&self, id: NodeId) -> StateResult<Node> {
        self.transition_to(id, Transition::To(NodeState::Idle))
    }

    /// Hard-delete a TERMINATED or ERROR node. Returns the deleted record.
    pub fn remove_node(&self, id: NodeId) -> StateResult<Node> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node = {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let node: Node = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NodeNotFound(id)),
            };
            if !node.state.is_removable() {
                return Err(StateError::NotRemovable {
                    id,
                    state: node.state,
                });
            }
            table.remove(id).map_err(map_err!(Write))?;
            node
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node_id = id, "node removed");
        Ok(node)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Create a deployment and make it the active one.
    ///
    /// The previously active deployment is stamped `superseded_at`.
    pub fn create_deployment(&self, commit_id: &str, image: &str) -> StateResult<Deployment> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = Self::next_id(&txn, META_NEXT_DEPLOYMENT_ID)?;
        let deployment = Deployment {
            id,
            commit_id: commit_id.to_string(),
            image: image.to_string(),
            created_at: now,
            superseded_at: None,
        };
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let previous = meta
                .insert(META_ACTIVE_DEPLOYMENT, id)
                .map_err(map_err!(Write))?
                .map(|guard| guard.value());

            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            if let Some(previous_id) = previous {
                let superseded = match table.get(previous_id).map_err(map_err!(Read))? {
                    Some(guard) => {
                        let mut old: Deployment = serde_json::from_slice(guard.value())
                            .map_err(map_err!(Deserialize))?;
                        old.superseded_at = Some(now);
                        Some(old)
                    }
                    None => None,
                };
                if let Some(old) = superseded {
                    let value = serde_json::to_vec(&old).map_err(map_err!(Serialize))?;
                    table
                        .insert(previous_id, value.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }

            let value = serde_json::to_vec(&deployment).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = id, %commit_id, "deployment activated");
        Ok(deployment)
    }

    /// Get a deployment by id.
    pub fn get_deployment(&self, id: DeploymentId) -> StateResult<Deployment> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Err(StateError::DeploymentNotFound(id)),
        }
    }

    /// The deployment new nodes must be created against, if any.
    pub fn get_active_deployment(&self) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        let Some(id) = meta
            .get(META_ACTIVE_DEPLOYMENT)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
        else {
            return Ok(None);
        };
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value())
                .map(Some)
                .map_err(map_err!(Deserialize)),
            None => Ok(None),
        }
    }

    /// List all deployments, oldest first.
    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let deployment: Deployment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(deployment);
        }
        Ok(results)
    }

    // ── Config overrides ───────────────────────────────────────────

    /// Insert or replace the config override of a routing group.
    pub fn upsert_config_override(
        &self,
        config_override: &NodeConfigOverride,
    ) -> StateResult<NodeConfigOverride> {
        let stored = NodeConfigOverride {
            updated_at: epoch_millis(),
            ..config_override.clone()
        };
        let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONFIG_OVERRIDES).map_err(map_err!(Table))?;
            table
                .insert(stored.routing_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(routing_id = %stored.routing_id, "config override stored");
        Ok(stored)
    }

    /// Get the config override of a routing group, if one exists.
    pub fn get_config_override(&self, routing_id: &str) -> StateResult<Option<NodeConfigOverride>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONFIG_OVERRIDES).map_err(map_err!(Table))?;
        match table.get(routing_id).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value())
                .map(Some)
                .map_err(map_err!(Deserialize)),
            None => Ok(None),
        }
    }

    /// Config overrides for the given routing groups, keyed by routing id.
    pub fn search_config_overrides<'a>(
        &self,
        routing_ids: impl IntoIterator<Item = &'a str>,
    ) -> StateResult<HashMap<RoutingId, NodeConfigOverride>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONFIG_OVERRIDES).map_err(map_err!(Table))?;
        let mut results = HashMap::new();
        for routing_id in routing_ids {
            if let Some(guard) = table.get(routing_id).map_err(map_err!(Read))? {
                let config_override: NodeConfigOverride =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                results.insert(routing_id.to_string(), config_override);
            }
        }
        Ok(results)
    }

    /// Delete the config override of a routing group. Returns the deleted record.
    pub fn remove_config_override(&self, routing_id: &str) -> StateResult<NodeConfigOverride> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(CONFIG_OVERRIDES).map_err(map_err!(Table))?;
            let removed = table.remove(routing_id).map_err(map_err!(Write))?;
            match removed {
                Some(guard) => serde_json::from_slice::<NodeConfigOverride>(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => return Err(StateError::OverrideNotFound(routing_id.to_string())),
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Take the lease `key` for `owner` until `now + ttl_ms`.
    ///
    /// Succeeds when the lease is free, expired, or already held by `owner`
    /// (which extends it). Returns false when another owner holds it.
    pub fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl_ms: u64,
        now: u64,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let current: Option<Lease> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            if current.is_some_and(|lease| lease.owner != owner && !lease.is_expired(now)) {
                return Ok(false);
            }

            let lease = Lease {
                owner: owner.to_string(),
                expires_at: now.saturating_add(ttl_ms),
            };
            let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    /// Release the lease `key` if `owner` holds it. Returns true if released.
    pub fn release_lease(&self, key: &str, owner: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let held_by_owner = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    let lease: Lease =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    lease.owner == owner
                }
                None => false,
            };
            if held_by_owner {
                table.remove(key).map_err(map_err!(Write))?;
            }
            held_by_owner
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }

    /// Push the expiry of a lease `owner` already holds to `now + ttl_ms`.
    ///
    /// Returns false without writing when the lease is gone or belongs to
    /// someone else.
    pub fn renew_lease(&self, key: &str, owner: &str, ttl_ms: u64, now: u64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let renewed = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let current: Option<Lease> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            match current {
                Some(mut lease) if lease.owner == owner => {
                    lease.expires_at = now.saturating_add(ttl_ms);
                    let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
                    table
                        .insert(key, value.as_slice())
                        .map_err(map_err!(Write))?;
                    true
                }
                _ => false,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(renewed)
    }

    /// Current holder of the lease `key`, expired or not.
    pub fn get_lease(&self, key: &str) -> StateResult<Option<Lease>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LEASES).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value())
                .map(Some)
                .map_err(map_err!(Deserialize)),
            None => Ok(None),
        }
    }

    /// Every node in the store, grouped by routing id (admin listing).
    pub fn list_nodes(&self) -> StateResult<BTreeMap<RoutingId, Vec<Node>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results: BTreeMap<RoutingId, Vec<Node>> = BTreeMap::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: Node =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.entry(node.routing_id.clone()).or_default().push(node);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_node(routing_id: &str, deployment_id: DeploymentId) -> NewNode {
        NewNode {
            routing_id: routing_id.to_string(),
            deployment_id,
            config: NodeConfig {
                image: "fleet/runner:1".to_string(),
                cpu_milli: 500,
                memory_mb: 512,
                storage_mb: 1024,
            },
        }
    }

    /// Create a node and force it into `state`.
    fn node_in_state(store: &StateStore, routing_id: &str, state: NodeState) -> Node {
        let mut node = store.create_node(&new_node(routing_id, 1)).unwrap();
        node.state = state;
        store.put_node(&node).unwrap();
        node
    }

    // ── Node CRUD ──────────────────────────────────────────────────

    #[test]
    fn node_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let node = store.create_node(&new_node("r1", 7)).unwrap();

        assert_eq!(node.state, NodeState::Pending);
        assert_eq!(node.deployment_id, 7);
        assert_eq!(node.url, None);
        assert_eq!(node.error, None);
        assert_eq!(node.created_at, node.last_state_transition_at);

        assert_eq!(store.get_node(node.id).unwrap(), node);
    }

    #[test]
    fn node_ids_are_monotonic() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.create_node(&new_node("r1", 1)).unwrap();
        let b = store.create_node(&new_node("r1", 1)).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn node_get_nonexistent_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.get_node(42).unwrap_err();
        assert!(matches!(err, StateError::NodeNotFound(42)));
        assert!(err.is_not_found());
    }

    #[test]
    fn put_node_advances_sequence() {
        let store = StateStore::open_in_memory().unwrap();
        let mut node = store.create_node(&new_node("r1", 1)).unwrap();
        node.id = 50;
        store.put_node(&node).unwrap();

        let next = store.create_node(&new_node("r1", 1)).unwrap();
        assert_eq!(next.id, 51);
    }

    // ── Transitions ────────────────────────────────────────────────

    #[test]
    fn every_pair_is_accepted_or_rejected_per_table() {
        let store = StateStore::open_in_memory().unwrap();
        for from in NodeState::ALL {
            for to in NodeState::ALL {
                let node = node_in_state(&store, "r1", from);
                let transition = match to {
                    NodeState::Running => Transition::Register {
                        url: "http://10.0.0.1:3000".to_string(),
                    },
                    NodeState::Error => Transition::Fail {
                        reason: "boom".to_string(),
                    },
                    other => Transition::To(other),
                };
                let result = store.transition_to(node.id, transition);
                if from.can_transition_to(to) {
                    let updated = result.unwrap();
                    assert_eq!(updated.state, to);
                    assert!(updated.last_state_transition_at > node.last_state_transition_at);
                } else {
                    assert!(
                        matches!(result, Err(StateError::InvalidTransition { .. })),
                        "{from} -> {to} should be rejected"
                    );
                    assert_eq!(store.get_node(node.id).unwrap().state, from);
                }
            }
        }
    }

    #[test]
    fn register_records_url() {
        let store = StateStore::open_in_memory().unwrap();
        let node = node_in_state(&store, "r1", NodeState::Starting);
        let node = store.register_node(node.id, "http://10.0.0.1:3000").unwrap();
        assert_eq!(node.state, NodeState::Running);
        assert_eq!(node.url.as_deref(), Some("http://10.0.0.1:3000"));
    }

    #[test]
    fn fail_records_reason() {
        let store = StateStore::open_in_memory().unwrap();
        let node = store.create_node(&new_node("r1", 1)).unwrap();
        let node = store.fail_node(node.id, "my error").unwrap();
        assert_eq!(node.state, NodeState::Error);
        assert_eq!(node.error.as_deref(), Some("my error"));
    }

    #[test]
    fn transition_unknown_node_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.idle_node(9).unwrap_err();
        assert!(matches!(err, StateError::NodeNotFound(9)));
    }

    // ── Removal ────────────────────────────────────────────────────

    #[test]
    fn remove_only_terminal_nodes() {
        let store = StateStore::open_in_memory().unwrap();
        let running = node_in_state(&store, "r1", NodeState::Running);
        let terminated = node_in_state(&store, "r1", NodeState::Terminated);
        let errored = node_in_state(&store, "r1", NodeState::Error);

        assert!(matches!(
            store.remove_node(running.id),
            Err(StateError::NotRemovable { .. })
        ));
        assert_eq!(store.remove_node(terminated.id).unwrap().id, terminated.id);
        assert_eq!(store.remove_node(errored.id).unwrap().id, errored.id);
        assert!(store.get_node(terminated.id).unwrap_err().is_not_found());
        assert!(store.get_node(running.id).is_ok());
    }

    // ── Search ─────────────────────────────────────────────────────

    #[test]
    fn search_groups_by_routing_id_and_state() {
        let store = StateStore::open_in_memory().unwrap();
        let pending = node_in_state(&store, "a", NodeState::Pending);
        let running = node_in_state(&store, "a", NodeState::Running);
        let idle = node_in_state(&store, "b", NodeState::Idle);

        let page = store.search_nodes(&NodeSearch::all_states()).unwrap();
        assert_eq!(page.nodes.len(), 2);
        assert_eq!(page.nodes["a"].get(NodeState::Pending), &[pending]);
        assert_eq!(page.nodes["a"].get(NodeState::Running), &[running.clone()]);
        assert_eq!(page.nodes["b"].get(NodeState::Idle), &[idle]);
        assert_eq!(page.next_cursor, None);

        let page = store
            .search_nodes(&NodeSearch::new(vec![NodeState::Running]))
            .unwrap();
        assert_eq!(page.nodes.len(), 1);
        assert_eq!(page.nodes["a"].get(NodeState::Running), &[running]);
    }

    #[test]
    fn search_filters_by_routing_id() {
        let store = StateStore::open_in_memory().unwrap();
        node_in_state(&store, "a", NodeState::Pending);
        node_in_state(&store, "b", NodeState::Terminated);

        let page = store
            .search_nodes(&NodeSearch::new(vec![NodeState::Pending]).with_routing_id("b"))
            .unwrap();
        assert!(page.nodes.is_empty());
    }

    #[test]
    fn search_paginates_with_inclusive_cursor() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..12 {
            store.create_node(&new_node(&i.to_string(), 1)).unwrap();
        }
        let search = NodeSearch::new(vec![NodeState::Pending]).with_limit(5);

        let first = store.search_nodes(&search).unwrap();
        assert_eq!(first.nodes.len(), 5);
        assert_eq!(first.next_cursor, Some(6));

        let second = store
            .search_nodes(&search.clone().with_cursor(first.next_cursor))
            .unwrap();
        assert_eq!(second.nodes.len(), 5);
        assert_eq!(second.next_cursor, Some(11));

        let third = store
            .search_nodes(&search.clone().with_cursor(second.next_cursor))
            .unwrap();
        assert_eq!(third.nodes.len(), 2);
        assert_eq!(third.next_cursor, None);
    }

    #[test]
    fn search_cursor_skips_non_matching_rows() {
        let store = StateStore::open_in_memory().unwrap();
        node_in_state(&store, "a", NodeState::Pending);
        node_in_state(&store, "a", NodeState::Running);
        node_in_state(&store, "a", NodeState::Running);
        let last = node_in_state(&store, "a", NodeState::Pending);

        let page = store
            .search_nodes(&NodeSearch::new(vec![NodeState::Pending]).with_limit(1))
            .unwrap();
        assert_eq!(page.next_cursor, Some(last.id));
    }

    // ── Deployments ────────────────────────────────────────────────

    #[test]
    fn no_active_deployment_on_empty_store() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_active_deployment().unwrap().is_none());
    }

    #[test]
    fn creating_deployment_supersedes_previous() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store.create_deployment("abc123", "fleet/runner:abc123").unwrap();
        let second = store.create_deployment("def456", "fleet/runner:def456").unwrap();

        let active = store.get_active_deployment().unwrap().unwrap();
        assert_eq!(active, second);

        let first = store.get_deployment(first.id).unwrap();
        assert!(first.superseded_at.is_some());
        assert_eq!(store.list_deployments().unwrap().len(), 2);
    }

    // ── Config overrides ───────────────────────────────────────────

    #[test]
    fn config_override_upsert_search_remove() {
        let store = StateStore::open_in_memory().unwrap();
        let ov = NodeConfigOverride {
            routing_id: "a".to_string(),
            cpu_milli: Some(2000),
            ..Default::default()
        };
        store.upsert_config_override(&ov).unwrap();

        let found = store.search_config_overrides(["a", "b"]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["a"].cpu_milli, Some(2000));

        let updated = NodeConfigOverride {
            memory_mb: Some(4096),
            ..ov
        };
        store.upsert_config_override(&updated).unwrap();
        let stored = store.get_config_override("a").unwrap().unwrap();
        assert_eq!(stored.memory_mb, Some(4096));

        store.remove_config_override("a").unwrap();
        assert!(store.get_config_override("a").unwrap().is_none());
        assert!(matches!(
            store.remove_config_override("a"),
            Err(StateError::OverrideNotFound(_))
        ));
    }

    // ── Leases ─────────────────────────────────────────────────────

    #[test]
    fn lease_is_exclusive_until_expiry() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.try_acquire_lease("lock", "one", 1000, 10_000).unwrap());
        assert!(!store.try_acquire_lease("lock", "two", 1000, 10_500).unwrap());
        // Re-entrant for the holder.
        assert!(store.try_acquire_lease("lock", "one", 1000, 10_500).unwrap());
        // Expired leases can be taken over.
        assert!(store.try_acquire_lease("lock", "two", 1000, 11_500).unwrap());
        assert_eq!(store.get_lease("lock").unwrap().unwrap().owner, "two");
    }

    #[test]
    fn lease_renewal_extends_only_own_lease() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(!store.renew_lease("lock", "one", 1000, 0).unwrap());

        store.try_acquire_lease("lock", "one", 1000, 10_000).unwrap();
        assert!(store.renew_lease("lock", "one", 1000, 10_900).unwrap());
        assert_eq!(store.get_lease("lock").unwrap().unwrap().expires_at, 11_900);
        // Past the original expiry the renewed lease still keeps others out.
        assert!(!store.try_acquire_lease("lock", "two", 1000, 11_500).unwrap());

        assert!(!store.renew_lease("lock", "two", 1000, 11_500).unwrap());
        assert_eq!(store.get_lease("lock").unwrap().unwrap().owner, "one");
    }

    #[test]
    fn lease_release_requires_ownership() {
        let store = StateStore::open_in_memory().unwrap();
        store.try_acquire_lease("lock", "one", 1000, 0).unwrap();

        assert!(!store.release_lease("lock", "two").unwrap());
        assert!(store.release_lease("lock", "one").unwrap());
        assert!(store.get_lease("lock").unwrap().is_none());
        assert!(store.try_acquire_lease("lock", "two", 1000, 1).unwrap());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("fleet.redb");

        let node_id = {
            let store = StateStore::open(&db_path).unwrap();
            store.create_deployment("abc", "fleet/runner:abc").unwrap();
            store.create_node(&new_node("r1", 1)).unwrap().id
        };

        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get_node(node_id).unwrap().routing_id, "r1");
        assert_eq!(store.get_active_deployment().unwrap().unwrap().commit_id, "abc");
        // Sequence survives too.
        assert!(store.create_node(&new_node("r1", 1)).unwrap().id > node_id);
    }

    #[test]
    fn list_nodes_groups_everything() {
        let store = StateStore::open_in_memory().unwrap();
        node_in_state(&store, "a", NodeState::Running);
        node_in_state(&store, "a", NodeState::Error);
        node_in_state(&store, "b", NodeState::Idle);

        let all = store.list_nodes().unwrap();
        assert_eq!(all["a"].len(), 2);
        assert_eq!(all["b"].len(), 1);
    }
}
