//! BallistaCluster controller implementation
//!
//! Each run re-reads the cluster, observes its pods through the child index,
//! lets the state machine decide, applies the resulting actions and writes
//! the status back with optimistic concurrency. Error classification happens
//! here: validation and rejected actions are surfaced in status, observation
//! failures drive `Unknown`, everything else goes to [`error_policy`] for
//! backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, Preconditions};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::children::{ChildManager, ScaleOutcome};
use crate::config::OperatorConfig;
use crate::crd::{
    BallistaCluster, BallistaClusterStatus, ClusterState, Condition, ConditionStatus, Role,
};
use crate::events::{self, actions, reasons, EventPublisher, KubeEventPublisher};
use crate::index::{owner_of, ChildIndex, OwnerRef};
use crate::retry::{delay_for, retry_on, BackoffTracker, RetryConfig};
use crate::state::{decide, ChildAction, Decision};
use crate::status::{evaluate, HealthSummary, Observation};
use crate::{Error, CLEANUP_FINALIZER, CLUSTER_LABEL, FIELD_MANAGER};

/// Condition types written to `status.conditions`
pub mod conditions {
    /// Scheduler and all executors are ready
    pub const READY: &str = "Ready";
    /// The spec passed validation
    pub const SPEC_VALID: &str = "SpecValid";
    /// The last create/delete calls were accepted
    pub const ACTIONS_SUCCEEDING: &str = "ActionsSucceeding";
}

/// Requeue used after an action so the result is verified right away
const IMMEDIATE: Duration = Duration::ZERO;

/// Requeue after adding the finalizer
const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);

/// Trait abstracting Kubernetes API operations used by the controller
///
/// This trait allows mocking the API server in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a cluster; `None` when it no longer exists
    async fn get_cluster(&self, namespace: &str, name: &str)
        -> Result<Option<BallistaCluster>, Error>;

    /// Merge-patch the status of a cluster
    ///
    /// With `resource_version` set the write fails with a conflict if the
    /// object changed since it was read.
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BallistaClusterStatus,
        resource_version: Option<String>,
    ) -> Result<(), Error>;

    /// Add a finalizer to a cluster (no-op if present)
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer from a cluster (no-op if absent)
    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Fetch a pod; `None` when it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Create a pod and return the stored object
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Delete a pod, guarded by a UID precondition when `uid` is set
    ///
    /// Returns the pod while it is terminating gracefully, `None` once gone.
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        uid: Option<String>,
    ) -> Result<Option<Pod>, Error>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn clusters(&self, namespace: &str) -> Api<BallistaCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut Vec<String>) -> bool + Send,
    ) -> Result<(), Error> {
        let api = self.clusters(namespace);
        let cluster = api.get(name).await?;
        let mut finalizers = cluster.metadata.finalizers.clone().unwrap_or_default();

        if !edit(&mut finalizers) {
            return Ok(());
        }

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": cluster.resource_version(),
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BallistaCluster>, Error> {
        Ok(self.clusters(namespace).get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BallistaClusterStatus,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        let patch = match resource_version {
            Some(rv) => serde_json::json!({
                "metadata": { "resourceVersion": rv },
                "status": status,
            }),
            None => serde_json::json!({ "status": status }),
        };

        self.clusters(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.patch_finalizers(namespace, name, |finalizers| {
            if finalizers.iter().any(|f| f == finalizer) {
                return false;
            }
            finalizers.push(finalizer.to_string());
            true
        })
        .await
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.patch_finalizers(namespace, name, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            finalizers.len() != before
        })
        .await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        Ok(self.pods(namespace).create(&Default::default(), pod).await?)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        uid: Option<String>,
    ) -> Result<Option<Pod>, Error> {
        let params = DeleteParams {
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid),
                resource_version: None,
            }),
            ..Default::default()
        };

        let deleted = self.pods(namespace).delete(name, &params).await?;
        Ok(deleted.left())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.pods(namespace).list(&params).await?.items)
    }
}

/// Controller context shared by all reconciliation runs
pub struct Context {
    /// Kubernetes API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Owner/role index over child pods
    pub index: Arc<dyn ChildIndex>,
    /// Creates and deletes child pods
    pub children: ChildManager,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Operator configuration
    pub config: OperatorConfig,
    /// Per-cluster error backoff
    pub backoff: BackoffTracker,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, index: Arc<dyn ChildIndex>) -> ContextBuilder {
        ContextBuilder::new(client, index)
    }

    /// Create a context from explicit collaborators
    ///
    /// Used by tests and by callers that bring their own API client.
    pub fn from_parts(
        kube: Arc<dyn KubeClient>,
        index: Arc<dyn ChildIndex>,
        events: Arc<dyn EventPublisher>,
        config: OperatorConfig,
    ) -> Self {
        let children = ChildManager::new(kube.clone(), index.clone(), config.clone());
        let backoff = BackoffTracker::new(config.backoff_base, config.backoff_max);
        Self {
            kube,
            index,
            children,
            events,
            config,
            backoff,
        }
    }

    /// Create a context for testing with mock collaborators and no events
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, index: Arc<dyn ChildIndex>) -> Self {
        Self::from_parts(
            kube,
            index,
            Arc::new(crate::events::NoopEventPublisher),
            OperatorConfig::default(),
        )
    }

    async fn publish(
        &self,
        cluster: &BallistaCluster,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        events::record(self.events.as_ref(), cluster, type_, reason, action, note).await;
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client, index)
///     .config(config)
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    index: Arc<dyn ChildIndex>,
    kube: Option<Arc<dyn KubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: OperatorConfig,
}

impl ContextBuilder {
    fn new(client: Client, index: Arc<dyn ChildIndex>) -> Self {
        Self {
            client,
            index,
            kube: None,
            events: None,
            config: OperatorConfig::default(),
        }
    }

    /// Set the operator configuration
    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let events = self.events.unwrap_or_else(|| {
            Arc::new(KubeEventPublisher::new(
                self.client.clone(),
                "ballista-cluster-controller",
            ))
        });
        Context::from_parts(kube, self.index, events, self.config)
    }
}

/// Reconcile a BallistaCluster resource
///
/// The run is bounded by `reconcile_timeout`; on expiry the remaining
/// actions are abandoned and the error is retried with backoff.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<BallistaCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = cluster_key(&cluster);
    debug!("reconciling cluster");

    let outcome = tokio::time::timeout(ctx.config.reconcile_timeout, reconcile_run(&cluster, &ctx))
        .await
        .unwrap_or_else(|_| {
            Err(Error::transient(format!(
                "reconciliation exceeded {}s deadline",
                ctx.config.reconcile_timeout.as_secs()
            )))
        });

    match outcome {
        Ok(action) => {
            ctx.backoff.reset(&key);
            Ok(action)
        }
        // The cluster vanished mid-run; its deletion event ends the story
        Err(e) if e.is_not_found() => {
            debug!(error = %e, "cluster disappeared during reconciliation");
            ctx.backoff.reset(&key);
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

/// Requeue failed runs with per-cluster exponential backoff
pub fn error_policy(cluster: Arc<BallistaCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let delay = ctx.backoff.next_delay(&cluster_key(&cluster));
    if error.is_retryable() {
        warn!(
            %error,
            cluster = %cluster.name_any(),
            class = ?error.class(),
            retry_in_secs = delay.as_secs(),
            "reconciliation failed, retrying"
        );
    } else {
        error!(
            ?error,
            cluster = %cluster.name_any(),
            class = ?error.class(),
            retry_in_secs = delay.as_secs(),
            "reconciliation failed"
        );
    }
    Action::requeue(delay)
}

fn cluster_key(cluster: &BallistaCluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

fn has_finalizer(cluster: &BallistaCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == CLEANUP_FINALIZER)
}

async fn reconcile_run(trigger: &BallistaCluster, ctx: &Context) -> Result<Action, Error> {
    let name = trigger.name_any();
    let namespace = trigger.namespace().ok_or_else(|| {
        Error::internal_with_context("reconciler", format!("cluster {name} has no namespace"))
    })?;

    // Work on the latest resourceVersion, not the cached trigger
    let Some(cluster) = ctx.kube.get_cluster(&namespace, &name).await? else {
        debug!("cluster no longer exists");
        return Ok(Action::await_change());
    };

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, ctx).await;
    }

    if !has_finalizer(&cluster) {
        info!("Adding cleanup finalizer");
        retry_on(&conflict_retry(ctx), "add finalizer", Error::is_conflict, || {
            ctx.kube.add_finalizer(&namespace, &name, CLEANUP_FINALIZER)
        })
        .await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    let status = cluster.status.clone().unwrap_or_default();
    let generation = cluster.metadata.generation;

    // Failure counts belong to the generation that produced them
    let prior_failures = if status.observed_generation == generation {
        status.action_failures
    } else {
        0
    };

    if let Err(e) = cluster.spec.validate(&name) {
        return handle_invalid_spec(&cluster, ctx, &status, e).await;
    }

    if prior_failures >= ctx.config.max_action_failures {
        debug!(
            failures = prior_failures,
            "reconciliation suspended until the spec changes"
        );
        return Ok(Action::await_change());
    }

    let owner = OwnerRef::of(&cluster)?;
    let observation = evaluate(ctx.index.as_ref(), &owner, &cluster.spec);
    let decision = decide(status.state, &observation);
    debug!(current = %status.state, next = %decision.next, actions = ?decision.actions, "state machine decision");

    let summary = match &observation {
        Observation::Healthy(summary) => summary,
        Observation::Failed(reason) => {
            return handle_observation_failure(&cluster, ctx, &status, &decision, reason).await;
        }
    };

    let changed = match apply_actions(&cluster, &owner, &decision, ctx).await {
        Ok(changed) => changed,
        Err(e @ Error::PermanentAction { .. }) => {
            return handle_action_failure(&cluster, ctx, &status, prior_failures, e).await;
        }
        Err(Error::Observation(reason)) => {
            return handle_observation_failure(&cluster, ctx, &status, &decision, &reason).await;
        }
        Err(e) => return Err(e),
    };

    let next = decision.settle(changed);
    let new_status = healthy_status(&status, next, summary, generation);
    if status.state != next {
        info!(from = %status.state, to = %next, "cluster state changed");
        ctx.publish(
            &cluster,
            EventType::Normal,
            reasons::STATE_CHANGED,
            actions::RECONCILE,
            format!("{} -> {}: {}", status.state, next, summary.describe()),
        )
        .await;
    }
    write_status(&cluster, ctx, &status, new_status).await?;

    Ok(if changed {
        Action::requeue(IMMEDIATE)
    } else if !next.is_transient() {
        Action::await_change()
    } else {
        Action::requeue(ctx.config.requeue_pending)
    })
}

/// Run the state machine's actions; returns whether any pod changed
async fn apply_actions(
    cluster: &BallistaCluster,
    owner: &OwnerRef,
    decision: &Decision,
    ctx: &Context,
) -> Result<bool, Error> {
    let mut changed = false;

    for action in &decision.actions {
        match action {
            ChildAction::EnsureScheduler => {
                if ctx.children.ensure_scheduler(cluster).await? {
                    changed = true;
                    ctx.publish(
                        cluster,
                        EventType::Normal,
                        reasons::SCHEDULER_CREATED,
                        actions::RECONCILE,
                        format!("scheduler pod {}-scheduler ensured", owner.name),
                    )
                    .await;
                }
            }
            ChildAction::ScaleExecutors => {
                let current = ctx.index.children_of_role(owner, Role::Executor)?;
                let outcome = ctx.children.reconcile_executors(cluster, &current).await?;
                if outcome.changed() {
                    changed = true;
                    ctx.publish(
                        cluster,
                        EventType::Normal,
                        reasons::EXECUTORS_SCALED,
                        actions::SCALE,
                        describe_scale(&outcome),
                    )
                    .await;
                }
            }
        }
    }

    Ok(changed)
}

fn describe_scale(outcome: &ScaleOutcome) -> String {
    format!(
        "created executors {:?}, deleted {:?}",
        outcome.created, outcome.deleted
    )
}

fn healthy_status(
    previous: &BallistaClusterStatus,
    state: ClusterState,
    summary: &HealthSummary,
    generation: Option<i64>,
) -> BallistaClusterStatus {
    let (ready, reason) = match state {
        ClusterState::Running => (ConditionStatus::True, "Running"),
        _ => (ConditionStatus::False, "Converging"),
    };

    let mut status = previous
        .clone()
        .state(state)
        .message(summary.describe())
        .condition(Condition::new(
            conditions::READY,
            ready,
            reason,
            summary.describe(),
        ))
        .condition(Condition::new(
            conditions::SPEC_VALID,
            ConditionStatus::True,
            "Valid",
            "spec passed validation",
        ))
        .condition(Condition::new(
            conditions::ACTIONS_SUCCEEDING,
            ConditionStatus::True,
            "Succeeded",
            "all child actions succeeded",
        ));

    status.scheduler_ready = summary.scheduler_ready;
    status.executors_ready = summary.executors_ready;
    status.executors_desired = summary.executors_desired;
    status.observed_generation = generation;
    status.action_failures = 0;
    status
}

async fn handle_observation_failure(
    cluster: &BallistaCluster,
    ctx: &Context,
    previous: &BallistaClusterStatus,
    decision: &Decision,
    reason: &str,
) -> Result<Action, Error> {
    warn!(reason, "could not observe child pods");

    let mut status = previous
        .clone()
        .state(decision.next)
        .message(format!("child pods could not be observed: {reason}"))
        .condition(Condition::new(
            conditions::READY,
            ConditionStatus::Unknown,
            "ObservationFailed",
            reason,
        ));
    status.observed_generation = cluster.metadata.generation;

    if previous.state != decision.next {
        ctx.publish(
            cluster,
            EventType::Warning,
            reasons::STATE_CHANGED,
            actions::RECONCILE,
            format!("{} -> {}: {reason}", previous.state, decision.next),
        )
        .await;
    }
    write_status(cluster, ctx, previous, status).await?;
    Ok(Action::requeue(ctx.config.requeue_pending))
}

async fn handle_invalid_spec(
    cluster: &BallistaCluster,
    ctx: &Context,
    previous: &BallistaClusterStatus,
    error: Error,
) -> Result<Action, Error> {
    warn!(error = %error, "cluster validation failed");

    let message = error.to_string();
    let mut status = previous
        .clone()
        .state(Decision::invalid().next)
        .message(message.clone())
        .condition(Condition::new(
            conditions::SPEC_VALID,
            ConditionStatus::False,
            "InvalidSpec",
            message.clone(),
        ))
        .condition(Condition::new(
            conditions::READY,
            ConditionStatus::Unknown,
            "InvalidSpec",
            message.clone(),
        ));
    status.observed_generation = cluster.metadata.generation;

    if status != *previous {
        ctx.publish(
            cluster,
            EventType::Warning,
            reasons::VALIDATION_FAILED,
            actions::RECONCILE,
            message,
        )
        .await;
    }
    write_status(cluster, ctx, previous, status).await?;

    // Only a spec change can fix this
    Ok(Action::await_change())
}

async fn handle_action_failure(
    cluster: &BallistaCluster,
    ctx: &Context,
    previous: &BallistaClusterStatus,
    prior_failures: u32,
    error: Error,
) -> Result<Action, Error> {
    let failures = prior_failures.saturating_add(1);
    let max = ctx.config.max_action_failures;
    warn!(error = %error, failures, max, "child action rejected");

    let state = match previous.state {
        ClusterState::New => ClusterState::New,
        _ => ClusterState::Pending,
    };
    let message = error.to_string();
    let mut status = previous
        .clone()
        .state(state)
        .message(message.clone())
        .condition(Condition::new(
            conditions::ACTIONS_SUCCEEDING,
            ConditionStatus::False,
            "ActionRejected",
            message.clone(),
        ));
    status.action_failures = failures;
    status.observed_generation = cluster.metadata.generation;

    ctx.publish(
        cluster,
        EventType::Warning,
        reasons::ACTION_FAILED,
        actions::RECONCILE,
        message,
    )
    .await;
    write_status(cluster, ctx, previous, status).await?;

    if failures >= max {
        warn!(failures, "suspending reconciliation until the spec changes");
        ctx.publish(
            cluster,
            EventType::Warning,
            reasons::RECONCILE_SUSPENDED,
            actions::RECONCILE,
            format!("{failures} consecutive action failures; update the spec to retry"),
        )
        .await;
        return Ok(Action::await_change());
    }

    Ok(Action::requeue(delay_for(
        ctx.config.backoff_base,
        ctx.config.backoff_max,
        failures - 1,
    )))
}

/// Patch status if it changed, re-reading the cluster on version conflicts
async fn write_status(
    cluster: &BallistaCluster,
    ctx: &Context,
    previous: &BallistaClusterStatus,
    status: BallistaClusterStatus,
) -> Result<(), Error> {
    if cluster.status.is_some() && *previous == status {
        return Ok(());
    }

    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let attempts = ctx.config.conflict_retries.max(1);
    let mut resource_version = cluster.resource_version();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match ctx
            .kube
            .patch_status(&namespace, &name, &status, resource_version.clone())
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(attempt, "status conflict, re-reading cluster");
                match ctx.kube.get_cluster(&namespace, &name).await? {
                    Some(fresh) => resource_version = fresh.resource_version(),
                    None => return Ok(()),
                }
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

fn conflict_retry(ctx: &Context) -> RetryConfig {
    RetryConfig::conflicts(ctx.config.conflict_retries)
}

/// Delete all children of a cluster that is being deleted, then release it
///
/// The finalizer is removed only once the index reports no children and a
/// live list against the API server confirms that none remain.
pub async fn handle_deletion(cluster: &BallistaCluster, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(cluster) {
        return Ok(Action::await_change());
    }

    let name = cluster.name_any();
    let owner = OwnerRef::of(cluster)?;
    let previous = cluster.status.clone().unwrap_or_default();

    if previous.state != ClusterState::Terminating {
        info!("cluster deletion requested, removing child pods");
        ctx.publish(
            cluster,
            EventType::Normal,
            reasons::DELETION_STARTED,
            actions::DELETE,
            "deleting scheduler and executor pods".to_string(),
        )
        .await;
        let status = previous
            .clone()
            .state(ClusterState::Terminating)
            .message("deleting child pods");
        if let Err(e) = write_status(cluster, ctx, &previous, status).await {
            debug!(error = %e, "could not record Terminating state");
        }
    }

    let remaining = match ctx.children.delete_children(&owner).await {
        Ok(remaining) => remaining,
        Err(Error::Observation(reason)) => {
            debug!(%reason, "index unavailable, retrying cleanup later");
            return Ok(Action::requeue(ctx.config.requeue_pending));
        }
        Err(e) => return Err(e),
    };
    if remaining > 0 {
        debug!(remaining, "waiting for child pods to terminate");
        return Ok(Action::requeue(ctx.config.requeue_pending));
    }

    let selector = format!("{CLUSTER_LABEL}={name}");
    let live: Vec<Pod> = ctx
        .kube
        .list_pods(&owner.namespace, &selector)
        .await?
        .into_iter()
        .filter(|p| owner_of(p).is_some_and(|o| o.uid == owner.uid))
        .collect();
    if !live.is_empty() {
        debug!(remaining = live.len(), "API server still reports child pods");
        ctx.children.delete_all(&owner, &live).await?;
        return Ok(Action::requeue(ctx.config.requeue_pending));
    }

    retry_on(&conflict_retry(ctx), "remove finalizer", Error::is_conflict, || {
        ctx.kube
            .remove_finalizer(&owner.namespace, &name, CLEANUP_FINALIZER)
    })
    .await?;
    info!("child pods gone, finalizer removed");
    Ok(Action::await_change())
}
