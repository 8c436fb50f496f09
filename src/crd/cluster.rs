//! BallistaCluster Custom Resource Definition
//!
//! A BallistaCluster declares one Ballista scheduler plus a pool of
//! executors. The operator owns every pod it creates for the cluster and
//! reports an aggregated lifecycle state back in the status subresource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{BallistaPodSpec, ClusterState, Condition, ExecutorSpec, SchedulerSpec};

/// Specification for a BallistaCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ballista.minzhou.info",
    version = "v1",
    kind = "BallistaCluster",
    plural = "ballistaclusters",
    shortname = "bc",
    status = "BallistaClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.ballistaVersion"}"#,
    printcolumn = r#"{"name":"Executors","type":"integer","jsonPath":".spec.executor.instances"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.executorsReady"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BallistaClusterSpec {
    /// Ballista release; also the tag of the default images
    pub ballista_version: String,

    /// Image used by both roles unless a role overrides it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerSpec,

    /// Executor settings and desired instance count
    #[serde(default)]
    pub executor: ExecutorSpec,
}

impl BallistaClusterSpec {
    /// Validate the cluster specification
    ///
    /// `cluster` is only used to label the returned error.
    pub fn validate(&self, cluster: &str) -> Result<(), crate::Error> {
        if self.ballista_version.trim().is_empty() {
            return Err(crate::Error::validation_for_field(
                cluster,
                "spec.ballistaVersion",
                "ballistaVersion must not be empty",
            ));
        }

        if let Some(image) = &self.image {
            if image.trim().is_empty() {
                return Err(crate::Error::validation_for_field(
                    cluster,
                    "spec.image",
                    "image must not be empty when set",
                ));
            }
        }

        if self.executor.instances < 1 {
            return Err(crate::Error::validation_for_field(
                cluster,
                "spec.executor.instances",
                format!(
                    "instances must be at least 1, got {}",
                    self.executor.instances
                ),
            ));
        }

        validate_pod_spec(cluster, "spec.scheduler", &self.scheduler.pod)?;
        validate_pod_spec(cluster, "spec.executor", &self.executor.pod)?;
        Ok(())
    }

    /// Desired executor count, clamped at zero
    pub fn desired_executors(&self) -> u32 {
        u32::try_from(self.executor.instances).unwrap_or(0)
    }
}

fn validate_pod_spec(cluster: &str, path: &str, pod: &BallistaPodSpec) -> Result<(), crate::Error> {
    if let Some(image) = &pod.image {
        if image.trim().is_empty() {
            return Err(crate::Error::validation_for_field(
                cluster,
                format!("{path}.image"),
                "image must not be empty when set",
            ));
        }
    }

    let mut seen = std::collections::BTreeSet::new();
    for (i, port) in pod.ports.iter().enumerate() {
        let field = format!("{path}.ports[{i}]");
        if port.name.is_empty() {
            return Err(crate::Error::validation_for_field(
                cluster,
                field,
                "port name must not be empty",
            ));
        }
        if !(1..=65535).contains(&port.container_port) {
            return Err(crate::Error::validation_for_field(
                cluster,
                field,
                format!("containerPort {} out of range 1-65535", port.container_port),
            ));
        }
        if !matches!(port.protocol.as_str(), "TCP" | "UDP" | "SCTP") {
            return Err(crate::Error::validation_for_field(
                cluster,
                field,
                format!("unsupported protocol {}", port.protocol),
            ));
        }
        if !seen.insert(port.name.as_str()) {
            return Err(crate::Error::validation_for_field(
                cluster,
                field,
                format!("duplicate port name {}", port.name),
            ));
        }
    }

    for (i, mount) in pod.volume_mounts.iter().enumerate() {
        if !pod.volumes.iter().any(|v| v.name == mount.name) {
            return Err(crate::Error::validation_for_field(
                cluster,
                format!("{path}.volumeMounts[{i}]"),
                format!("volume {} is not declared in volumes", mount.name),
            ));
        }
    }

    Ok(())
}

/// Status for a BallistaCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BallistaClusterStatus {
    /// Current lifecycle state
    #[serde(default)]
    pub state: ClusterState,

    /// Whether the scheduler pod is ready
    #[serde(default)]
    pub scheduler_ready: bool,

    /// Number of ready executor pods
    #[serde(default)]
    pub executors_ready: u32,

    /// Number of executor pods requested by the spec
    #[serde(default)]
    pub executors_desired: u32,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation of the spec this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Consecutive permanently failed actions for the observed generation
    #[serde(default)]
    pub action_failures: u32,
}

impl BallistaClusterStatus {
    /// Set the state and return self for chaining
    pub fn state(mut self, state: ClusterState) -> Self {
        self.state = state;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    ///
    /// A condition whose status is unchanged keeps its original transition time.
    pub fn condition(mut self, mut condition: Condition) -> Self {
        if let Some(existing) = self.conditions.iter().find(|c| c.type_ == condition.type_) {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
        }
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
        self
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}
