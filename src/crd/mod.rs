//! Custom Resource Definitions for the Ballista operator

mod cluster;
mod types;

pub use cluster::{BallistaCluster, BallistaClusterSpec, BallistaClusterStatus};
pub use types::{
    BallistaPodSpec, ClusterState, Condition, ConditionStatus, ExecutorSpec, Port, Role,
    SchedulerSpec,
};
