//! Health evaluation of a cluster's child pods
//!
//! A failed index query becomes [`Observation::Failed`], never an empty
//! summary: "could not look" and "nothing there" lead to different states.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::children::{excess_executors, executor_name, is_terminating, ordinal_of, scheduler_name};
use crate::crd::{BallistaClusterSpec, Role};
use crate::index::{ChildIndex, OwnerRef};

/// Aggregated health of a cluster's pods
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthSummary {
    /// A scheduler pod exists
    pub scheduler_present: bool,
    /// The scheduler pod is ready
    pub scheduler_ready: bool,
    /// Executor pods present, including excess and terminating ones
    pub executors_present: u32,
    /// Ready executors within the desired ordinal range
    pub executors_ready: u32,
    /// Executors requested by the spec
    pub executors_desired: u32,
    /// Executors outside the desired ordinal range
    pub excess_executors: u32,
}

impl HealthSummary {
    /// Whether the summary satisfies the Running condition
    pub fn is_running(&self) -> bool {
        self.scheduler_ready
            && self.executors_ready == self.executors_desired
            && self.excess_executors == 0
    }

    /// Short human-readable description
    pub fn describe(&self) -> String {
        let scheduler = match (self.scheduler_present, self.scheduler_ready) {
            (false, _) => "scheduler missing",
            (true, false) => "scheduler not ready",
            (true, true) => "scheduler ready",
        };
        let mut msg = format!(
            "{scheduler}, {}/{} executors ready",
            self.executors_ready, self.executors_desired
        );
        if self.excess_executors > 0 {
            msg.push_str(&format!(", {} excess executors", self.excess_executors));
        }
        msg
    }
}

/// Result of observing a cluster's children
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// The index answered
    Healthy(HealthSummary),
    /// The index could not answer
    Failed(String),
}

/// A pod is ready when it is Running, its Ready condition is True, and it is
/// not being deleted
pub fn is_ready(pod: &Pod) -> bool {
    if is_terminating(pod) {
        return false;
    }
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .conditions
            .as_ref()
            .is_some_and(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// Fold the scheduler and executor pods of `cluster` into a summary
pub fn summarize(cluster: &str, desired: u32, schedulers: &[Pod], executors: &[Pod]) -> HealthSummary {
    let scheduler = schedulers
        .iter()
        .find(|p| p.name_any() == scheduler_name(cluster));

    let executors_ready = executors
        .iter()
        .filter(|p| {
            ordinal_of(p)
                .is_some_and(|o| o < desired && p.name_any() == executor_name(cluster, o))
        })
        .filter(|p| is_ready(p))
        .count();

    HealthSummary {
        scheduler_present: scheduler.is_some(),
        scheduler_ready: scheduler.is_some_and(is_ready),
        executors_present: saturating_u32(executors.len()),
        executors_ready: saturating_u32(executors_ready),
        executors_desired: desired,
        excess_executors: saturating_u32(excess_executors(cluster, desired, executors)),
    }
}

/// Observe the children of `owner` through the index
pub fn evaluate(index: &dyn ChildIndex, owner: &OwnerRef, spec: &BallistaClusterSpec) -> Observation {
    let schedulers = match index.children_of_role(owner, Role::Scheduler) {
        Ok(pods) => pods,
        Err(e) => return Observation::Failed(e.to_string()),
    };
    let executors = match index.children_of_role(owner, Role::Executor) {
        Ok(pods) => pods,
        Err(e) => return Observation::Failed(e.to_string()),
    };

    Observation::Healthy(summarize(
        &owner.name,
        spec.desired_executors(),
        &schedulers,
        &executors,
    ))
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
