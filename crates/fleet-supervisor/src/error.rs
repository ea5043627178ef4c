//! Supervisor error types.

use fleet_provider::ProviderError;
use fleet_state::{NodeId, StateError};
use thiserror::Error;

/// Errors raised while planning or executing a tick.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("no active deployment")]
    NoActiveDeployment,

    #[error("url not found for node {0}")]
    NodeUrlNotFound(NodeId),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Planning or execution failed; wraps the underlying cause.
    #[error("tick failed: {0}")]
    Tick(Box<SupervisorError>),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Errors from the store-backed lease lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another owner holds an unexpired lease on the key.
    #[error("lock {0} is held by another owner")]
    Busy(String),

    #[error("lease store error: {0}")]
    State(#[from] StateError),
}
