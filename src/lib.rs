//! Ballista operator - Kubernetes controller for Ballista compute clusters
//!
//! A `BallistaCluster` declares one scheduler and a pool of executors. The
//! operator keeps the set of pods owned by each cluster converged on that
//! declaration and folds pod health back into a cluster-level state.
//!
//! # Architecture
//!
//! Each reconciliation run is level-triggered:
//! - the [`index`] answers "which pods belong to this cluster, in which role"
//! - [`status`] folds those pods into a health observation
//! - [`state`] decides the next lifecycle state and the actions to take
//! - [`children`] creates and deletes scheduler/executor pods
//! - [`controller`] ties the above together and persists status
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (BallistaCluster)
//! - [`controller`] - Reconciliation dispatcher and cleanup handler
//! - [`children`] - Scheduler/executor pod construction and scaling
//! - [`index`] - Owner/role index over pods, fed by a watcher
//! - [`status`] - Health evaluation of child pods
//! - [`state`] - Lifecycle state machine
//! - [`config`] - Operator configuration
//! - [`events`] - Kubernetes Event publishing
//! - [`telemetry`] - Tracing subscriber setup
//! - [`retry`] - Conflict retries and requeue backoff
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod children;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod index;
pub mod retry;
pub mod state;
pub mod status;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known names
// =============================================================================

/// Finalizer held on every cluster until its pods are gone
pub const CLEANUP_FINALIZER: &str = "ballista.minzhou.info/cleanup";

/// Label carrying the pod's role (`scheduler` or `executor`)
pub const ROLE_LABEL: &str = "ballista.minzhou.info/role";

/// Label carrying the owning cluster's name
pub const CLUSTER_LABEL: &str = "ballista.minzhou.info/cluster";

/// Label carrying an executor's 0-based ordinal
pub const ORDINAL_LABEL: &str = "ballista.minzhou.info/executor-ordinal";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "ballista-operator";
