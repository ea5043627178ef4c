//! fleet-supervisor: the control loop that keeps the fleet converged.
//!
//! Every tick reads a fresh snapshot of the node store, derives the
//! operations that move each routing group toward the active deployment,
//! and applies them in order. No state is carried between ticks except
//! what the store holds.
//!
//! # Architecture
//!
//! ```text
//! Supervisor (run loop: stopped / running / stopping)
//!   └── StoreLock ("fleet_supervisor" lease, bounded by tick_timeout)
//!         └── tick()
//!               ├── plan()          pure: snapshot + deployment + overrides → Vec<Operation>
//!               └── execute_plan()  sequential, checks the cancel flag between ops
//!                     ├── StateStore     (validated transitions)
//!                     ├── NodeProvider   (start / terminate)
//!                     └── DrainNotifier  (POST {url}/notifyWhenIdle)
//! ```
//!
//! Several supervisors may share one store. Only the lease holder ticks.
//! When a tick outlives its budget the lock fires a callback that raises the
//! cancel flag; the executor stops before the next operation and leaves the
//! rest to the next tick.

pub mod config;
pub mod error;
pub mod lock;
pub mod notify;
pub mod operation;
pub mod planner;
pub mod supervisor;

pub use config::{NotifyConfig, RunnerMode, StateTimeouts, SupervisorConfig};
pub use error::{LockError, SupervisorError, SupervisorResult};
pub use lock::StoreLock;
pub use notify::DrainNotifier;
pub use operation::{FailReason, Operation};
pub use planner::plan;
pub use supervisor::{LOCK_KEY, RunState, Supervisor, TickReport};
