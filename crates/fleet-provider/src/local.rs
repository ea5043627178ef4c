//! Local process provider.
//!
//! Each node runs as a child process of the daemon. The child learns who it
//! is through environment variables and is expected to register itself with
//! the fleet API once it serves on `NODE_PORT`.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use fleet_state::{Node, NodeConfig, NodeId};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::NodeProvider;
use crate::error::{ProviderError, ProviderResult};

/// Settings for [`LocalProvider`], read from the `[provider]` config section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LocalProviderConfig {
    /// Program started once per node.
    pub command: String,
    pub args: Vec<String>,
    /// Host the children listen on.
    pub host: String,
    /// Node `n` listens on `base_port + n % port_range`.
    pub base_port: u16,
    pub port_range: u16,
    /// Fleet API address handed to children for registration.
    pub api_url: Option<String>,
    pub image: String,
    pub cpu_milli: u32,
    pub memory_mb: u32,
    pub storage_mb: u32,
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            command: "fleet-runner".to_string(),
            args: Vec::new(),
            host: "127.0.0.1".to_string(),
            base_port: 3100,
            port_range: 1000,
            api_url: None,
            image: "fleet/runner:latest".to_string(),
            cpu_milli: 500,
            memory_mb: 512,
            storage_mb: 20_000,
        }
    }
}

impl LocalProviderConfig {
    pub fn port_for(&self, id: NodeId) -> u16 {
        let range = u64::from(self.port_range.max(1));
        self.base_port.saturating_add((id % range) as u16)
    }
}

/// Runs nodes as local child processes.
pub struct LocalProvider {
    config: LocalProviderConfig,
    children: Mutex<HashMap<NodeId, Child>>,
}

impl LocalProvider {
    pub fn new(config: LocalProviderConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Number of children currently tracked.
    pub async fn running(&self) -> usize {
        self.children.lock().await.len()
    }
}

#[async_trait]
impl NodeProvider for LocalProvider {
    fn default_node_config(&self) -> NodeConfig {
        NodeConfig {
            image: self.config.image.clone(),
            cpu_milli: self.config.cpu_milli,
            memory_mb: self.config.memory_mb,
            storage_mb: self.config.storage_mb,
        }
    }

    async fn start(&self, node: &Node) -> ProviderResult<()> {
        let mut children = self.children.lock().await;
        if children.contains_key(&node.id) {
            debug!(node_id = node.id, "local node already running");
            return Ok(());
        }

        let port = self.config.port_for(node.id);
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .env("NODE_ID", node.id.to_string())
            .env("NODE_PORT", port.to_string())
            .env("NODE_HOST", &self.config.host)
            .env("ROUTING_ID", &node.routing_id)
            .env("IMAGE", &node.image)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(api_url) = &self.config.api_url {
            cmd.env("FLEET_API_URL", api_url);
        }

        let child = cmd.spawn().map_err(|e| ProviderError::Start {
            node_id: node.id,
            message: format!("spawn {}: {e}", self.config.command),
        })?;
        info!(node_id = node.id, port, pid = ?child.id(), "local node spawned");
        children.insert(node.id, child);
        Ok(())
    }

    async fn terminate(&self, node: &Node) -> ProviderResult<()> {
        let child = self.children.lock().await.remove(&node.id);
        let Some(mut child) = child else {
            debug!(node_id = node.id, "no local process to terminate");
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(node_id = node.id, %status, "local node already exited");
            return Ok(());
        }
        child.kill().await.map_err(|e| {
            warn!(node_id = node.id, error = %e, "failed to kill local node");
            ProviderError::Terminate {
                node_id: node.id,
                message: e.to_string(),
            }
        })?;
        info!(node_id = node.id, "local node terminated");
        Ok(())
    }

    fn verify_url(&self, url: &str) -> ProviderResult<()> {
        let prefix = format!("http://{}:", self.config.host);
        if url.starts_with(&prefix) {
            Ok(())
        } else {
            Err(ProviderError::InvalidUrl(url.to_string()))
        }
    }
}
