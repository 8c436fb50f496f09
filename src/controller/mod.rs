//! Controller for BallistaCluster resources
//!
//! Reconciliation follows the observe-decide-act loop: child pods are
//! observed through the owner/role index, the lifecycle state machine picks
//! the next state, and the child manager converges the pods.

mod cluster;

pub use cluster::{
    conditions, error_policy, handle_deletion, reconcile, Context, ContextBuilder, KubeClient,
    KubeClientImpl,
};

#[cfg(test)]
pub use cluster::MockKubeClient;
