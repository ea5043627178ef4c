//! fleet-api: REST API for the fleet.
//!
//! Nodes call in here to report their own lifecycle events (registered,
//! idle); operators use it to roll deployments and tune routing groups.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/nodes?state=&routing_id=&cursor=&limit=` | Search nodes |
//! | GET | `/api/v1/nodes/{id}` | Get a node |
//! | POST | `/api/v1/nodes/{id}/register` | STARTING → RUNNING with `{url}` |
//! | POST | `/api/v1/nodes/{id}/idle` | Report a node idle |
//! | POST | `/api/v1/routing/{routing_id}/nodes` | Create a node now |
//! | GET/PUT/DELETE | `/api/v1/routing/{routing_id}/config` | Config override |
//! | GET | `/api/v1/deployments` | List deployments |
//! | POST | `/api/v1/deployments` | Create and activate a deployment |
//! | GET | `/api/v1/deployments/active` | Active deployment |
//! | GET | `/api/v1/supervisor` | Run state of this instance |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use fleet_supervisor::Supervisor;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Supervisor,
}

/// Build the complete API router.
pub fn build_router(supervisor: Supervisor) -> Router {
    let api_state = ApiState { supervisor };

    let api_routes = Router::new()
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/{id}", get(handlers::get_node))
        .route("/nodes/{id}/register", post(handlers::register_node))
        .route("/nodes/{id}/idle", post(handlers::idle_node))
        .route("/routing/{routing_id}/nodes", post(handlers::create_node))
        .route(
            "/routing/{routing_id}/config",
            get(handlers::get_config_override)
                .put(handlers::put_config_override)
                .delete(handlers::delete_config_override),
        )
        .route("/deployments", get(handlers::list_deployments).post(handlers::create_deployment))
        .route("/deployments/active", get(handlers::get_active_deployment))
        .route("/supervisor", get(handlers::supervisor_status))
        .with_state(api_state);

    Router::new().nest("/api/v1", api_routes)
}
