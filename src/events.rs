//! Kubernetes Event recording for BallistaCluster objects
//!
//! Events are fire-and-forget: failures are logged and never propagate, so a
//! broken event sink cannot stall reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use tracing::warn;

use crate::crd::BallistaCluster;

/// Publishes Kubernetes Events about a resource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`; never fails
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Publish an Event on a cluster object
pub async fn record(
    publisher: &dyn EventPublisher,
    cluster: &BallistaCluster,
    type_: EventType,
    reason: &str,
    action: &str,
    note: impl Into<String>,
) {
    publisher
        .publish(&cluster.object_ref(&()), type_, reason, action, Some(note.into()))
        .await;
}

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    /// Scheduler pod created
    pub const SCHEDULER_CREATED: &str = "SchedulerCreated";
    /// Executor pods created or deleted
    pub const EXECUTORS_SCALED: &str = "ExecutorsScaled";
    /// Cluster entered a new lifecycle state
    pub const STATE_CHANGED: &str = "StateChanged";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A create/delete was rejected by the API server
    pub const ACTION_FAILED: &str = "ActionFailed";
    /// Reconciliation suspended after repeated action failures
    pub const RECONCILE_SUSPENDED: &str = "ReconcileSuspended";
    /// Deletion of child pods started
    pub const DELETION_STARTED: &str = "DeletionStarted";
}

/// Event actions (ACTION column of `kubectl get events`)
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Scaling executors
    pub const SCALE: &str = "Scale";
    /// Deleting child pods
    pub const DELETE: &str = "Delete";
}
