//! fleet-state: embedded state store for the fleet control loop.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for nodes, deployments, per-routing-group config
//! overrides, and the leases used for cross-instance mutual exclusion.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Nodes are keyed by their store-assigned `u64` id, so an id range scan
//! doubles as cursor pagination.
//!
//! Every node state change goes through [`StateStore::transition_to`], which
//! validates the move against [`NodeState::can_transition_to`] inside a single
//! write transaction. redb serializes writers, so concurrent supervisors
//! never interleave a read-validate-write sequence.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, epoch_millis};
pub use types::*;
