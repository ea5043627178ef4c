//! In-memory provider that records every call.
//!
//! Holds no compute. Failures and latency can be switched on at runtime so
//! tests can drive the supervisor's error paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleet_state::{Node, NodeConfig, NodeId};
use tracing::debug;

use crate::NodeProvider;
use crate::error::{ProviderError, ProviderResult};

type StartHook = Box<dyn Fn(&Node) + Send + Sync>;

pub struct MemoryProvider {
    default_config: NodeConfig,
    started: Mutex<Vec<NodeId>>,
    terminated: Mutex<Vec<NodeId>>,
    fail_start: AtomicBool,
    fail_terminate: AtomicBool,
    start_delay: Duration,
    on_start: Option<StartHook>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            default_config: NodeConfig {
                image: "fleet/runner:latest".to_string(),
                cpu_milli: 500,
                memory_mb: 512,
                storage_mb: 20_000,
            },
            started: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
            fail_terminate: AtomicBool::new(false),
            start_delay: Duration::ZERO,
            on_start: None,
        }
    }

    pub fn with_default_config(mut self, config: NodeConfig) -> Self {
        self.default_config = config;
        self
    }

    /// Sleep this long inside every `start` call.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Run `hook` at the top of every `start` call.
    pub fn with_start_hook(mut self, hook: impl Fn(&Node) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_terminate(&self, fail: bool) {
        self.fail_terminate.store(fail, Ordering::SeqCst);
    }

    /// Ids passed to `start`, in call order (failed calls included).
    pub fn started(&self) -> Vec<NodeId> {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ids passed to `terminate`, in call order (failed calls included).
    pub fn terminated(&self) -> Vec<NodeId> {
        self.terminated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl NodeProvider for MemoryProvider {
    fn default_node_config(&self) -> NodeConfig {
        self.default_config.clone()
    }

    async fn start(&self, node: &Node) -> ProviderResult<()> {
        if let Some(hook) = &self.on_start {
            hook(node);
        }
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(node.id);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ProviderError::Start {
                node_id: node.id,
                message: "start disabled".to_string(),
            });
        }
        debug!(node_id = node.id, "memory provider started node");
        Ok(())
    }

    async fn terminate(&self, node: &Node) -> ProviderResult<()> {
        self.terminated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(node.id);
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(ProviderError::Terminate {
                node_id: node.id,
                message: "terminate disabled".to_string(),
            });
        }
        debug!(node_id = node.id, "memory provider terminated node");
        Ok(())
    }
}
