//! fleet-provider: the seam between the supervisor and real compute.
//!
//! A [`NodeProvider`] knows how to bring a node's compute up and tear it
//! down. The supervisor never talks to infrastructure directly: every START
//! and TERMINATE goes through this trait.
//!
//! Two implementations ship here:
//!
//! - [`MemoryProvider`] records calls in memory, with programmable failures
//!   and delays. Used by tests across the workspace.
//! - [`LocalProvider`] runs each node as a child process on this host.

pub mod error;
pub mod local;
pub mod memory;

use async_trait::async_trait;
use fleet_state::{Node, NodeConfig};

pub use error::{ProviderError, ProviderResult};
pub use local::{LocalProvider, LocalProviderConfig};
pub use memory::MemoryProvider;

/// Provisioning backend for nodes.
///
/// Implementations must be safe to call from several tasks at once.
/// `terminate` may be called for a node whose compute is already gone and
/// must succeed in that case.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Spec new nodes get unless the deployment or an override says otherwise.
    fn default_node_config(&self) -> NodeConfig;

    /// Begin provisioning compute for `node`.
    ///
    /// Returning `Ok` means the request was accepted, not that the node is
    /// serving. The node reports RUNNING on its own through registration.
    async fn start(&self, node: &Node) -> ProviderResult<()>;

    /// Release the compute backing `node`.
    async fn terminate(&self, node: &Node) -> ProviderResult<()>;

    /// Check that a URL a node registered with belongs to this provider.
    fn verify_url(&self, _url: &str) -> ProviderResult<()> {
        Ok(())
    }
}
