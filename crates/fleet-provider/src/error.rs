//! Error types for node providers.

use fleet_state::NodeId;
use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to start node {node_id}: {message}")]
    Start { node_id: NodeId, message: String },

    #[error("failed to terminate node {node_id}: {message}")]
    Terminate { node_id: NodeId, message: String },

    #[error("url not served by this provider: {0}")]
    InvalidUrl(String),
}
