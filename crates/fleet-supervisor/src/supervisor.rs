//! Supervisor: run loop, tick, and executor.
//!
//! The run state lives in a `watch` channel. `start()` and `stop()` signal
//! through it; only the loop task moves the state from `Stopping` to
//! `Stopped`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fleet_provider::NodeProvider;
use fleet_state::{
    Deployment, NewNode, Node, NodeSearch, NodeState, NodesByState, RoutingId, StateStore,
    Transition, epoch_millis,
};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::config::{RunnerMode, StateTimeouts, SupervisorConfig};
use crate::error::{LockError, SupervisorError, SupervisorResult};
use crate::lock::StoreLock;
use crate::notify::DrainNotifier;
use crate::operation::Operation;
use crate::planner;

/// Lease key serializing ticks across supervisor instances.
pub const LOCK_KEY: &str = "fleet_supervisor";

/// Lifecycle of the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running,
    Stopping,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Stopped => "stopped",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
        }
    }
}

/// What one pass of the executor did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub planned: usize,
    pub applied: usize,
    pub failed: usize,
    /// Operations left for the next tick after cancellation.
    pub skipped: usize,
}

/// Drives the fleet toward the active deployment.
///
/// Cheap to clone; clones share the loop, the cancel flag and the lock
/// identity.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    store: StateStore,
    provider: Arc<dyn NodeProvider>,
    lock: StoreLock,
    notifier: DrainNotifier,
    config: SupervisorConfig,
    timeouts: StateTimeouts,
    tick_cancelled: AtomicBool,
    state: watch::Sender<RunState>,
}

impl Supervisor {
    pub fn new(
        store: StateStore,
        provider: Arc<dyn NodeProvider>,
        config: SupervisorConfig,
    ) -> Self {
        let lock = StoreLock::new(store.clone());
        let notifier = DrainNotifier::new(config.notify.clone());
        let timeouts = config.state_timeouts();
        let (state, _) = watch::channel(RunState::Stopped);
        Self {
            inner: Arc::new(Inner {
                store,
                provider,
                lock,
                notifier,
                config,
                timeouts,
                tick_cancelled: AtomicBool::new(false),
                state,
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn provider(&self) -> &Arc<dyn NodeProvider> {
        &self.inner.provider
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Lease owner id of this instance.
    pub fn instance_id(&self) -> &str {
        self.inner.lock.owner()
    }

    pub fn run_state(&self) -> RunState {
        *self.inner.state.borrow()
    }

    // ── Run loop ───────────────────────────────────────────────────

    /// Launch the run loop in the background. No-op if already running.
    pub fn start(&self) {
        let mut spawn = false;
        self.inner.state.send_if_modified(|state| match *state {
            RunState::Running => false,
            RunState::Stopping => {
                // The old loop has not exited yet; it picks up the new state.
                *state = RunState::Running;
                true
            }
            RunState::Stopped => {
                *state = RunState::Running;
                spawn = true;
                true
            }
        });
        if spawn {
            info!(instance = %self.instance_id(), "supervisor starting");
            let this = self.clone();
            tokio::spawn(async move { this.run_loop().await });
        }
    }

    /// Ask the loop to stop and wait for it, bounded by `stop_timeout`.
    ///
    /// Returns once the loop has stopped or the timeout elapsed; in the
    /// latter case the current tick finishes in the background.
    pub async fn stop(&self) {
        let mut state_rx = self.inner.state.subscribe();
        self.inner.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Stopping;
                true
            } else {
                false
            }
        });
        if *state_rx.borrow_and_update() == RunState::Stopped {
            return;
        }

        let timeout = self.inner.config.stop_timeout;
        info!(?timeout, "supervisor stopping");
        let stopped = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| *state == RunState::Stopped),
        )
        .await;
        match stopped {
            Ok(_) => info!("supervisor stopped"),
            Err(_) => warn!(?timeout, "supervisor did not stop in time"),
        }
    }

    async fn run_loop(self) {
        match self.inner.store.get_active_deployment() {
            Ok(Some(deployment)) => {
                debug!(deployment_id = deployment.id, "supervisor loop entered");
            }
            Ok(None) => {
                error!("no active deployment, supervisor not running");
                self.inner.state.send_replace(RunState::Stopped);
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to load active deployment, supervisor not running");
                self.inner.state.send_replace(RunState::Stopped);
                return;
            }
        }

        let mut state_rx = self.inner.state.subscribe();
        loop {
            if self.run_state() != RunState::Running && self.finish_stopping() {
                break;
            }

            let delay = match self.locked_tick().await {
                Ok(report) => {
                    debug!(?report, "tick complete");
                    self.inner.config.tick_interval
                }
                Err(SupervisorError::Lock(LockError::Busy(_))) => {
                    debug!("another instance holds the supervisor lock");
                    self.inner.config.retry_delay
                }
                Err(e) => {
                    error!(error = %e, "tick failed");
                    self.inner.config.retry_delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = state_rx.wait_for(|state| *state == RunState::Stopping) => {}
            }
        }
        info!(instance = %self.instance_id(), "supervisor loop exited");
    }

    /// `Stopping -> Stopped`. False if `start()` revived the loop meanwhile.
    fn finish_stopping(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == RunState::Stopping {
                *state = RunState::Stopped;
                true
            } else {
                false
            }
        })
    }

    async fn locked_tick(&self) -> SupervisorResult<TickReport> {
        self.inner
            .lock
            .with_lock(
                LOCK_KEY,
                self.inner.config.tick_timeout,
                || self.cancel_tick(),
                self.tick(),
            )
            .await?
    }

    // ── Tick ───────────────────────────────────────────────────────

    /// Ask the executor to stop before its next operation.
    pub fn cancel_tick(&self) {
        self.inner.tick_cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_tick_cancelled(&self) -> bool {
        self.inner.tick_cancelled.load(Ordering::SeqCst)
    }

    /// Plan from a fresh snapshot and apply the result.
    ///
    /// Planning failures are fatal to the tick and come back as
    /// [`SupervisorError::Tick`]. Failures of single operations are logged
    /// and counted in the report.
    #[instrument(name = "fleet.supervisor.tick", skip_all)]
    pub async fn tick(&self) -> SupervisorResult<TickReport> {
        self.inner.tick_cancelled.store(false, Ordering::SeqCst);
        let operations = self
            .plan()
            .map_err(|e| SupervisorError::Tick(Box::new(e)))?;
        Ok(self.execute_plan(operations).await)
    }

    /// Operations for the current store state.
    #[instrument(name = "fleet.supervisor.plan", skip_all)]
    pub fn plan(&self) -> SupervisorResult<Vec<Operation>> {
        let store = &self.inner.store;
        let deployment = store
            .get_active_deployment()?
            .ok_or(SupervisorError::NoActiveDeployment)?;

        let mut groups: BTreeMap<RoutingId, NodesByState> = BTreeMap::new();
        let mut search = NodeSearch::all_states().with_limit(self.inner.config.page_size);
        let mut pages = 0usize;
        loop {
            let page = store.search_nodes(&search)?;
            pages += 1;
            for (routing_id, nodes) in page.nodes {
                groups.entry(routing_id).or_default().merge(nodes);
            }
            match page.next_cursor {
                Some(cursor) => search.cursor = Some(cursor),
                None => break,
            }
        }

        let overrides = store.search_config_overrides(groups.keys().map(String::as_str))?;
        let operations = planner::plan(
            &deployment,
            &groups,
            &overrides,
            &self.inner.timeouts,
            epoch_millis(),
        );
        debug!(
            deployment_id = deployment.id,
            groups = groups.len(),
            pages,
            operations = operations.len(),
            "plan computed"
        );
        Ok(operations)
    }

    /// Apply `operations` in order, stopping early if the tick is cancelled.
    #[instrument(name = "fleet.supervisor.execute_plan", skip_all, fields(operations = operations.len()))]
    pub async fn execute_plan(&self, operations: Vec<Operation>) -> TickReport {
        let mut report = TickReport {
            planned: operations.len(),
            ..TickReport::default()
        };

        for (index, operation) in operations.iter().enumerate() {
            if self.is_tick_cancelled() {
                report.skipped = report.planned - index;
                warn!(skipped = report.skipped, "tick cancelled, deferring remaining operations");
                break;
            }

            let span = info_span!(
                "fleet.supervisor.operation",
                kind = operation.kind(),
                node_id = ?operation.node_id(),
                routing_id = %operation.routing_id(),
            );
            match self.execute(operation).instrument(span).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(%operation, error = %e, "operation failed");
                }
            }
        }
        report
    }

    async fn execute(&self, operation: &Operation) -> SupervisorResult<()> {
        let store = &self.inner.store;
        match operation {
            Operation::Create {
                routing_id,
                deployment,
            } => {
                self.create_node(routing_id, deployment)?;
            }
            Operation::Start { node } => {
                if let Err(e) = self.inner.provider.start(node).await {
                    self.fail(node, &e.to_string()).await?;
                    return Err(e.into());
                }
                store.transition_to(node.id, Transition::To(NodeState::Starting))?;
            }
            Operation::Fail { node, reason } => {
                self.fail(node, &reason.to_string()).await?;
            }
            Operation::Outdate { node } => {
                store.transition_to(node.id, Transition::To(NodeState::Outdated))?;
            }
            Operation::Finishing { node } => {
                let url = node
                    .url
                    .as_deref()
                    .ok_or(SupervisorError::NodeUrlNotFound(node.id))?;
                // Courtesy signal; the transition goes ahead either way.
                self.inner.notifier.notify_when_idle(node.id, url).await;
                store.transition_to(node.id, Transition::To(NodeState::Finishing))?;
            }
            Operation::FinishingTimeout { node } => match self.inner.config.mode {
                RunnerMode::Local => {
                    // Local processes rarely outlive a stuck drain.
                    store.transition_to(node.id, Transition::To(NodeState::Idle))?;
                }
                RunnerMode::Remote => {
                    warn!(
                        node_id = node.id,
                        routing_id = %node.routing_id,
                        since = node.last_state_transition_at,
                        "node has been finishing past its timeout, needs operator attention"
                    );
                }
            },
            Operation::Terminate { node } => {
                if let Err(e) = self.inner.provider.terminate(node).await {
                    self.fail(node, &e.to_string()).await?;
                    return Err(e.into());
                }
                store.transition_to(node.id, Transition::To(NodeState::Terminated))?;
            }
            Operation::Remove { node } => {
                store.remove_node(node.id)?;
            }
        }
        Ok(())
    }

    /// Best-effort terminate, then ERROR with `reason`.
    async fn fail(&self, node: &Node, reason: &str) -> SupervisorResult<()> {
        if let Err(e) = self.inner.provider.terminate(node).await {
            warn!(node_id = node.id, error = %e, "terminate failed while failing node");
        }
        self.inner.store.fail_node(node.id, reason)?;
        info!(node_id = node.id, %reason, "node failed");
        Ok(())
    }

    // ── Node creation ──────────────────────────────────────────────

    /// Insert a PENDING node for `routing_id` on `deployment`.
    ///
    /// Spec resolution: provider default, the deployment's image, then any
    /// field set in the group's override.
    pub fn create_node(&self, routing_id: &str, deployment: &Deployment) -> SupervisorResult<Node> {
        let mut config = self.inner.provider.default_node_config();
        config.image = deployment.image.clone();
        if let Some(config_override) = self.inner.store.get_config_override(routing_id)? {
            config = config_override.apply(config);
        }

        let node = self.inner.store.create_node(&NewNode {
            routing_id: routing_id.to_string(),
            deployment_id: deployment.id,
            config,
        })?;
        info!(node_id = node.id, %routing_id, deployment_id = deployment.id, "node created");
        Ok(node)
    }

    /// Create a node for `routing_id` on the active deployment right now,
    /// outside the tick cadence.
    pub fn create_node_for_current_deployment(&self, routing_id: &str) -> SupervisorResult<Node> {
        let deployment = self
            .inner
            .store
            .get_active_deployment()?
            .ok_or(SupervisorError::NoActiveDeployment)?;
        self.create_node(routing_id, &deployment)
    }
}
