//! Error types for the fleet state store.

use thiserror::Error;

use crate::types::{NodeId, NodeState};

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(u64),

    #[error("config override not found for routing id {0}")]
    OverrideNotFound(String),

    #[error("invalid node state transition {from} -> {to}")]
    InvalidTransition { from: NodeState, to: NodeState },

    #[error("node {id} is {state} and cannot be removed")]
    NotRemovable { id: NodeId, state: NodeState },
}

impl StateError {
    /// Whether the error reports a missing record rather than a storage fault.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StateError::NodeNotFound(_)
                | StateError::DeploymentNotFound(_)
                | StateError::OverrideNotFound(_)
        )
    }
}
