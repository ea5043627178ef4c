//! REST API handlers.
//!
//! Each handler goes through the supervisor's `StateStore` (or the
//! supervisor itself for node creation) and returns the JSON envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fleet_provider::NodeProvider;
use fleet_state::*;
use fleet_supervisor::SupervisorError;
use serde::Deserialize;
use tracing::{info, warn};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Missing records are 404, rejected lifecycle moves 409, the rest 500.
fn state_error(e: &StateError) -> Response {
    let status = match e {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        StateError::InvalidTransition { .. } | StateError::NotRemovable { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

// ── Nodes ──────────────────────────────────────────────────────

/// Query string for node search.
#[derive(Debug, Default, Deserialize)]
pub struct NodeQuery {
    /// Comma-separated states; all states when absent.
    pub state: Option<String>,
    pub routing_id: Option<String>,
    pub cursor: Option<NodeId>,
    pub limit: Option<usize>,
}

impl NodeQuery {
    fn to_search(&self) -> Result<NodeSearch, String> {
        let mut search = match self.state.as_deref() {
            None | Some("") => NodeSearch::all_states(),
            Some(states) => NodeSearch::new(
                states
                    .split(',')
                    .map(|s| s.trim().parse::<NodeState>())
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        };
        if let Some(routing_id) = &self.routing_id {
            search = search.with_routing_id(routing_id.clone());
        }
        if let Some(limit) = self.limit {
            search = search.with_limit(limit);
        }
        Ok(search.with_cursor(self.cursor))
    }
}

#[derive(serde::Serialize)]
struct NodeList {
    nodes: Vec<Node>,
    next_cursor: Option<NodeId>,
}

/// GET /api/v1/nodes
pub async fn list_nodes(
    State(state): State<ApiState>,
    Query(query): Query<NodeQuery>,
) -> impl IntoResponse {
    let search = match query.to_search() {
        Ok(search) => search,
        Err(msg) => return error_response(&msg, StatusCode::BAD_REQUEST),
    };
    match state.supervisor.store().search_nodes(&search) {
        Ok(page) => {
            let mut nodes: Vec<Node> = page
                .nodes
                .values()
                .flat_map(|group| group.iter().cloned())
                .collect();
            nodes.sort_by_key(|node| node.id);
            ApiResponse::ok(NodeList {
                nodes,
                next_cursor: page.next_cursor,
            })
            .into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<NodeId>) -> impl IntoResponse {
    match state.supervisor.store().get_node(id) {
        Ok(node) => ApiResponse::ok(node).into_response(),
        Err(e) => state_error(&e),
    }
}

/// Register request body.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub url: String,
}

/// POST /api/v1/nodes/{id}/register
pub async fn register_node(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    if let Err(e) = state.supervisor.provider().verify_url(&req.url) {
        warn!(node_id = id, url = %req.url, "rejected registration url");
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST);
    }
    match state.supervisor.store().register_node(id, req.url) {
        Ok(node) => {
            info!(node_id = id, url = ?node.url, "node registered");
            ApiResponse::ok(node).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/nodes/{id}/idle
pub async fn idle_node(State(state): State<ApiState>, Path(id): Path<NodeId>) -> impl IntoResponse {
    match state.supervisor.store().idle_node(id) {
        Ok(node) => {
            info!(node_id = id, "node reported idle");
            ApiResponse::ok(node).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/routing/{routing_id}/nodes
pub async fn create_node(
    State(state): State<ApiState>,
    Path(routing_id): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.create_node_for_current_deployment(&routing_id) {
        Ok(node) => (StatusCode::CREATED, ApiResponse::ok(node)).into_response(),
        Err(SupervisorError::NoActiveDeployment) => {
            error_response("no active deployment", StatusCode::CONFLICT)
        }
        Err(SupervisorError::State(e)) => state_error(&e),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

// ── Config overrides ───────────────────────────────────────────

/// Override request body. Unset fields fall back to the deployment default.
#[derive(Debug, Default, Deserialize)]
pub struct OverrideRequest {
    pub image: Option<String>,
    pub cpu_milli: Option<u32>,
    pub memory_mb: Option<u32>,
    pub storage_mb: Option<u32>,
}

/// GET /api/v1/routing/{routing_id}/config
pub async fn get_config_override(
    State(state): State<ApiState>,
    Path(routing_id): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.store().get_config_override(&routing_id) {
        Ok(Some(config_override)) => ApiResponse::ok(config_override).into_response(),
        Ok(None) => error_response("config override not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

/// PUT /api/v1/routing/{routing_id}/config
pub async fn put_config_override(
    State(state): State<ApiState>,
    Path(routing_id): Path<String>,
    Json(req): Json<OverrideRequest>,
) -> impl IntoResponse {
    let config_override = NodeConfigOverride {
        routing_id,
        image: req.image,
        cpu_milli: req.cpu_milli,
        memory_mb: req.memory_mb,
        storage_mb: req.storage_mb,
        updated_at: 0,
    };
    match state.supervisor.store().upsert_config_override(&config_override) {
        Ok(stored) => ApiResponse::ok(stored).into_response(),
        Err(e) => state_error(&e),
    }
}

/// DELETE /api/v1/routing/{routing_id}/config
pub async fn delete_config_override(
    State(state): State<ApiState>,
    Path(routing_id): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.store().remove_config_override(&routing_id) {
        Ok(removed) => ApiResponse::ok(removed).into_response(),
        Err(e) => state_error(&e),
    }
}

// ── Deployments ────────────────────────────────────────────────

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> impl IntoResponse {
    match state.supervisor.store().list_deployments() {
        Ok(deployments) => ApiResponse::ok(deployments).into_response(),
        Err(e) => state_error(&e),
    }
}

/// Deployment request body.
#[derive(Debug, Deserialize)]
pub struct DeploymentRequest {
    pub commit_id: String,
    pub image: String,
}

/// POST /api/v1/deployments
pub async fn create_deployment(
    State(state): State<ApiState>,
    Json(req): Json<DeploymentRequest>,
) -> impl IntoResponse {
    if req.commit_id.is_empty() || req.image.is_empty() {
        return error_response("commit_id and image are required", StatusCode::BAD_REQUEST);
    }
    match state
        .supervisor
        .store()
        .create_deployment(&req.commit_id, &req.image)
    {
        Ok(deployment) => {
            info!(deployment_id = deployment.id, commit_id = %deployment.commit_id, "deployment activated");
            // The loop exits when it finds no deployment; bring it back.
            state.supervisor.start();
            (StatusCode::CREATED, ApiResponse::ok(deployment)).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/deployments/active
pub async fn get_active_deployment(State(state): State<ApiState>) -> impl IntoResponse {
    match state.supervisor.store().get_active_deployment() {
        Ok(Some(deployment)) => ApiResponse::ok(deployment).into_response(),
        Ok(None) => error_response("no active deployment", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

// ── Supervisor ─────────────────────────────────────────────────

/// GET /api/v1/supervisor
pub async fn supervisor_status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({
        "instance_id": state.supervisor.instance_id(),
        "state": state.supervisor.run_state().as_str(),
        "mode": state.supervisor.config().mode,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fleet_provider::{LocalProvider, LocalProviderConfig, MemoryProvider};
    use fleet_supervisor::{Supervisor, SupervisorConfig};

    use super::*;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let supervisor = Supervisor::new(
            store,
            Arc::new(MemoryProvider::new()),
            SupervisorConfig::default(),
        );
        ApiState { supervisor }
    }

    fn seed(state: &ApiState, routing_id: &str, node_state: NodeState) -> Node {
        let store = state.supervisor.store();
        let mut node = store
            .create_node(&NewNode {
                routing_id: routing_id.to_string(),
                deployment_id: 1,
                config: NodeConfig {
                    image: "fleet/runner:1".to_string(),
                    cpu_milli: 500,
                    memory_mb: 512,
                    storage_mb: 1024,
                },
            })
            .unwrap();
        node.state = node_state;
        store.put_node(&node).unwrap();
        node
    }

    fn register(url: &str) -> Json<RegisterRequest> {
        Json(RegisterRequest {
            url: url.to_string(),
        })
    }

    #[tokio::test]
    async fn list_nodes_empty() {
        let state = test_state();
        let resp = list_nodes(State(state), Query(NodeQuery::default())).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_nodes_rejects_unknown_state() {
        let state = test_state();
        let query = NodeQuery {
            state: Some("RUNNING,BOOTING".to_string()),
            ..Default::default()
        };
        let resp = list_nodes(State(state), Query(query)).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn node_query_parses_states_and_filters() {
        let query = NodeQuery {
            state: Some("running, idle".to_string()),
            routing_id: Some("g1".to_string()),
            cursor: Some(10),
            limit: Some(5),
        };
        let search = query.to_search().unwrap();
        assert_eq!(search.states, vec![NodeState::Running, NodeState::Idle]);
        assert_eq!(search.routing_id.as_deref(), Some("g1"));
        assert_eq!(search.cursor, Some(10));
        assert_eq!(search.limit, 5);
    }

    #[tokio::test]
    async fn get_nonexistent_node() {
        let state = test_state();
        let resp = get_node(State(state), Path(99)).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn register_starting_node() {
        let state = test_state();
        let node = seed(&state, "g1", NodeState::Starting);

        let resp = register_node(State(state.clone()), Path(node.id), register("http://10.0.0.1:3000")).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let node = state.supervisor.store().get_node(node.id).unwrap();
        assert_eq!(node.state, NodeState::Running);
        assert_eq!(node.url.as_deref(), Some("http://10.0.0.1:3000"));
    }

    #[tokio::test]
    async fn register_pending_node_conflicts() {
        let state = test_state();
        let node = seed(&state, "g1", NodeState::Pending);

        let resp = register_node(State(state.clone()), Path(node.id), register("http://10.0.0.1:3000")).await;
        assert_eq!(resp.into_response().status(), StatusCode::CONFLICT);
        assert_eq!(state.supervisor.store().get_node(node.id).unwrap().state, NodeState::Pending);
    }

    #[tokio::test]
    async fn register_rejects_foreign_url() {
        let store = StateStore::open_in_memory().unwrap();
        let provider = Arc::new(LocalProvider::new(LocalProviderConfig::default()));
        let state = ApiState {
            supervisor: Supervisor::new(store, provider, SupervisorConfig::local()),
        };
        let node = seed(&state, "g1", NodeState::Starting);

        let resp = register_node(State(state.clone()), Path(node.id), register("http://10.9.9.9:3000")).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.supervisor.store().get_node(node.id).unwrap().state, NodeState::Starting);
    }

    #[tokio::test]
    async fn idle_from_finishing_and_running() {
        let state = test_state();
        let finishing = seed(&state, "g1", NodeState::Finishing);
        let running = seed(&state, "g1", NodeState::Running);
        let terminated = seed(&state, "g1", NodeState::Terminated);

        let resp = idle_node(State(state.clone()), Path(finishing.id)).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
        let resp = idle_node(State(state.clone()), Path(running.id)).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
        let resp = idle_node(State(state), Path(terminated.id)).await;
        assert_eq!(resp.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn create_node_requires_active_deployment() {
        let state = test_state();
        let resp = create_node(State(state.clone()), Path("g1".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::CONFLICT);

        state.supervisor.store().create_deployment("abc", "fleet/runner:abc").unwrap();
        let resp = create_node(State(state.clone()), Path("g1".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::CREATED);
        assert_eq!(state.supervisor.store().list_nodes().unwrap()["g1"].len(), 1);
    }

    #[tokio::test]
    async fn deployment_lifecycle() {
        let state = test_state();
        let resp = get_active_deployment(State(state.clone())).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);

        let req = DeploymentRequest {
            commit_id: "abc".to_string(),
            image: "fleet/runner:abc".to_string(),
        };
        let resp = create_deployment(State(state.clone()), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::CREATED);

        let resp = get_active_deployment(State(state.clone())).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
        assert_ne!(state.supervisor.run_state(), fleet_supervisor::RunState::Stopped);
        state.supervisor.stop().await;
    }

    #[tokio::test]
    async fn create_deployment_validates_fields() {
        let state = test_state();
        let req = DeploymentRequest {
            commit_id: String::new(),
            image: "img".to_string(),
        };
        let resp = create_deployment(State(state), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn config_override_put_get_delete() {
        let state = test_state();
        let req = OverrideRequest {
            memory_mb: Some(2048),
            ..Default::default()
        };
        let resp = put_config_override(State(state.clone()), Path("g1".to_string()), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let resp = get_config_override(State(state.clone()), Path("g1".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let resp = delete_config_override(State(state.clone()), Path("g1".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
        let resp = delete_config_override(State(state), Path("g1".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }
}
