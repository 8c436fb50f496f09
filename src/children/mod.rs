//! Scheduler and executor pod management
//!
//! Pods are named deterministically (`{cluster}-scheduler`,
//! `{cluster}-executor-{ordinal}`), so a create that races with an earlier
//! run surfaces as `AlreadyExists` instead of a duplicate pod. Every
//! successful create or delete is written back into the child index so the
//! next query in the same run sees it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::controller::KubeClient;
use crate::crd::{BallistaCluster, BallistaPodSpec, Role};
use crate::index::{owner_of, ChildIndex, OwnerRef};
use crate::retry::{retry_on, RetryConfig};
use crate::{Error, Result, CLUSTER_LABEL, ORDINAL_LABEL, ROLE_LABEL};

/// Name of the scheduler pod of `cluster`
pub fn scheduler_name(cluster: &str) -> String {
    format!("{cluster}-scheduler")
}

/// Name of the executor pod with the given ordinal
pub fn executor_name(cluster: &str, ordinal: u32) -> String {
    format!("{cluster}-executor-{ordinal}")
}

/// Ordinal label of an executor pod, if present and parseable
pub fn ordinal_of(pod: &Pod) -> Option<u32> {
    pod.labels().get(ORDINAL_LABEL)?.parse().ok()
}

/// Whether deletion of the pod has already been requested
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Whether the pod has run to completion or failed (e.g. evicted)
pub fn is_terminal_phase(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Failed") | Some("Succeeded")
    )
}

/// Image for `role`: role override, then cluster image, then `{repository}:{version}`
pub fn resolve_image(cluster: &BallistaCluster, role: Role, config: &OperatorConfig) -> String {
    let spec = &cluster.spec;
    let (role_image, repository) = match role {
        Role::Scheduler => (
            spec.scheduler.pod.image.as_ref(),
            &config.default_scheduler_repository,
        ),
        Role::Executor => (
            spec.executor.pod.image.as_ref(),
            &config.default_executor_repository,
        ),
    };

    role_image
        .or(spec.image.as_ref())
        .cloned()
        .unwrap_or_else(|| format!("{repository}:{}", spec.ballista_version))
}

/// Build the pod for `role`; `ordinal` is required for executors
pub fn build_pod(
    cluster: &BallistaCluster,
    role: Role,
    ordinal: Option<u32>,
    config: &OperatorConfig,
) -> Result<Pod> {
    let owner = OwnerRef::of(cluster)?;
    let (name, pod_spec) = match (role, ordinal) {
        (Role::Scheduler, _) => (scheduler_name(&owner.name), &cluster.spec.scheduler.pod),
        (Role::Executor, Some(ordinal)) => (
            executor_name(&owner.name, ordinal),
            &cluster.spec.executor.pod,
        ),
        (Role::Executor, None) => {
            return Err(Error::internal_with_context(
                "children",
                "executor pod requires an ordinal",
            ))
        }
    };

    // User labels first so the operator's own labels always win
    let mut labels = pod_spec.labels.clone();
    labels.insert(ROLE_LABEL.to_string(), role.as_str().to_string());
    labels.insert(CLUSTER_LABEL.to_string(), owner.name.clone());
    if let Some(ordinal) = ordinal.filter(|_| role == Role::Executor) {
        labels.insert(ORDINAL_LABEL.to_string(), ordinal.to_string());
    }

    let mut env = vec![EnvVar {
        name: "BALLISTA_CLUSTER".to_string(),
        value: Some(owner.name.clone()),
        ..Default::default()
    }];
    if let Some(ordinal) = ordinal.filter(|_| role == Role::Executor) {
        env.push(EnvVar {
            name: "BALLISTA_EXECUTOR_ORDINAL".to_string(),
            value: Some(ordinal.to_string()),
            ..Default::default()
        });
    }
    // User-provided variables override the generated ones
    env.retain(|generated| !pod_spec.env.iter().any(|e| e.name == generated.name));
    env.extend(pod_spec.env.iter().cloned());

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(owner.namespace.clone()),
            labels: Some(labels),
            annotations: non_empty(&pod_spec.annotations),
            owner_references: Some(vec![controller_reference(&owner)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container(cluster, role, pod_spec, env, config)],
            node_selector: non_empty(&pod_spec.node_selector),
            tolerations: non_empty_vec(&pod_spec.tolerations),
            service_account_name: pod_spec.service_account_name.clone(),
            volumes: non_empty_vec(&pod_spec.volumes),
            init_containers: non_empty_vec(&pod_spec.init_containers),
            affinity: pod_spec.affinity.clone(),
            security_context: pod_spec.security_context.clone(),
            image_pull_secrets: non_empty_vec(&pod_spec.image_pull_secrets),
            priority_class_name: pod_spec.priority_class_name.clone(),
            ..Default::default()
        }),
        status: None,
    })
}

fn container(
    cluster: &BallistaCluster,
    role: Role,
    pod_spec: &BallistaPodSpec,
    env: Vec<EnvVar>,
    config: &OperatorConfig,
) -> Container {
    let ports: Vec<ContainerPort> = pod_spec
        .ports
        .iter()
        .map(|p| ContainerPort {
            name: Some(p.name.clone()),
            container_port: p.container_port,
            protocol: Some(p.protocol.clone()),
            ..Default::default()
        })
        .collect();

    Container {
        name: role.as_str().to_string(),
        image: Some(resolve_image(cluster, role, config)),
        image_pull_policy: pod_spec.image_pull_policy.clone(),
        command: pod_spec.command.clone(),
        args: pod_spec.args.clone(),
        env: Some(env),
        resources: pod_spec.resources.clone(),
        ports: (!ports.is_empty()).then_some(ports),
        volume_mounts: non_empty_vec(&pod_spec.volume_mounts),
        security_context: pod_spec.container_security_context.clone(),
        lifecycle: pod_spec.lifecycle.clone(),
        ..Default::default()
    }
}

fn controller_reference(owner: &OwnerRef) -> OwnerReference {
    OwnerReference {
        api_version: BallistaCluster::api_version(&()).to_string(),
        kind: BallistaCluster::kind(&()).to_string(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn non_empty(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then(|| map.clone())
}

fn non_empty_vec<T: Clone>(items: &[T]) -> Option<Vec<T>> {
    (!items.is_empty()).then(|| items.to_vec())
}

/// What one executor reconciliation changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScaleOutcome {
    /// Ordinals created, lowest first
    pub created: Vec<u32>,
    /// Pod names deleted, in deletion order
    pub deleted: Vec<String>,
}

impl ScaleOutcome {
    /// Whether any pod was created or deleted
    pub fn changed(&self) -> bool {
        !self.created.is_empty() || !self.deleted.is_empty()
    }
}

/// Plan for one executor reconciliation
#[derive(Debug, Default, PartialEq, Eq)]
struct ExecutorPlan {
    create: Vec<u32>,
    /// Indices into the current pod list
    delete: Vec<usize>,
    excess: usize,
}

/// Compute which ordinals to create and which pods to delete
///
/// Deletions are ordered unparseable first, then highest ordinal first.
fn plan_executors(cluster: &str, desired: u32, current: &[Pod]) -> ExecutorPlan {
    let mut occupied = BTreeSet::new();
    let mut doomed: Vec<(Option<u32>, usize)> = Vec::new();

    for (i, pod) in current.iter().enumerate() {
        let ordinal = ordinal_of(pod).filter(|o| pod.name_any() == executor_name(cluster, *o));
        let in_range = ordinal.is_some_and(|o| o < desired);

        if in_range {
            if let Some(o) = ordinal {
                occupied.insert(o);
            }
        }
        if is_terminating(pod) {
            continue;
        }
        if !in_range || is_terminal_phase(pod) {
            doomed.push((ordinal, i));
        }
    }

    doomed.sort_by(|a, b| match (a.0, b.0) {
        (None, None) => a.1.cmp(&b.1),
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x),
    });

    let excess = current
        .iter()
        .filter(|p| {
            !ordinal_of(p)
                .filter(|o| p.name_any() == executor_name(cluster, *o))
                .is_some_and(|o| o < desired)
        })
        .count();

    ExecutorPlan {
        create: (0..desired).filter(|o| !occupied.contains(o)).collect(),
        delete: doomed.into_iter().map(|(_, i)| i).collect(),
        excess,
    }
}

/// Number of executor pods outside the desired ordinal range
pub fn excess_executors(cluster: &str, desired: u32, current: &[Pod]) -> usize {
    plan_executors(cluster, desired, current).excess
}

/// Creates, scales and deletes the pods of a cluster
pub struct ChildManager {
    kube: Arc<dyn KubeClient>,
    index: Arc<dyn ChildIndex>,
    config: OperatorConfig,
    retry: RetryConfig,
}

impl ChildManager {
    /// Create a manager writing through `kube` and recording into `index`
    pub fn new(kube: Arc<dyn KubeClient>, index: Arc<dyn ChildIndex>, config: OperatorConfig) -> Self {
        let retry = RetryConfig::conflicts(config.conflict_retries);
        Self {
            kube,
            index,
            config,
            retry,
        }
    }

    /// Make sure the scheduler pod exists and is controlled by `cluster`
    ///
    /// Returns true when a pod was created or a failed scheduler was deleted
    /// for replacement.
    pub async fn ensure_scheduler(&self, cluster: &BallistaCluster) -> Result<bool> {
        let owner = OwnerRef::of(cluster)?;
        let name = scheduler_name(&owner.name);

        let existing = self.index.children_of_role(&owner, Role::Scheduler)?;
        if let Some(pod) = existing.iter().find(|p| p.name_any() == name) {
            if is_terminal_phase(pod) && !is_terminating(pod) {
                info!(cluster = %owner, pod = %name, "Replacing scheduler in terminal phase");
                self.delete(&owner, pod).await?;
                return Ok(true);
            }
            return Ok(false);
        }

        let pod = build_pod(cluster, Role::Scheduler, None, &self.config)?;
        match self.create(&owner, &pod).await {
            Ok(()) => {
                info!(cluster = %owner, pod = %name, "Created scheduler pod");
                Ok(true)
            }
            Err(Error::AlreadyExists(_)) => self.adopt_existing(&owner, &name).await.map(|()| false),
            Err(e) => Err(e),
        }
    }

    /// Resolve `AlreadyExists` on a create by checking who owns the pod
    ///
    /// A pod controlled by `owner` is recorded in the index; any other pod
    /// holding the name is a permanent failure.
    async fn adopt_existing(&self, owner: &OwnerRef, name: &str) -> Result<()> {
        let live = self.kube.get_pod(&owner.namespace, name).await?;
        match live {
            Some(pod) if owner_of(&pod).is_some_and(|o| o.uid == owner.uid) => {
                debug!(cluster = %owner, pod = %name, "Pod already exists");
                self.index.record_applied(&pod);
                Ok(())
            }
            Some(_) => Err(Error::permanent_action(
                &owner.name,
                format!("create pod {name}"),
                format!("pod {name} exists and is not controlled by this cluster"),
            )),
            None => Err(Error::transient(format!(
                "pod {name} reported as existing but is gone"
            ))),
        }
    }

    /// Scale executors to `spec.executor.instances`
    ///
    /// `current` is the executor set reported by the index. A converged set
    /// yields no API calls.
    pub async fn reconcile_executors(
        &self,
        cluster: &BallistaCluster,
        current: &[Pod],
    ) -> Result<ScaleOutcome> {
        let owner = OwnerRef::of(cluster)?;
        let desired = cluster.spec.desired_executors();
        let plan = plan_executors(&owner.name, desired, current);
        let mut outcome = ScaleOutcome::default();

        for ordinal in plan.create {
            let pod = build_pod(cluster, Role::Executor, Some(ordinal), &self.config)?;
            match self.create(&owner, &pod).await {
                Ok(()) => outcome.created.push(ordinal),
                // Created by an earlier run the index has not seen yet, or taken
                Err(Error::AlreadyExists(_)) => {
                    self.adopt_existing(&owner, &pod.name_any()).await?
                }
                Err(e) => return Err(e),
            }
        }

        for i in plan.delete {
            let pod = &current[i];
            self.delete(&owner, pod).await?;
            outcome.deleted.push(pod.name_any());
        }

        if outcome.changed() {
            info!(
                cluster = %owner,
                desired,
                created = ?outcome.created,
                deleted = ?outcome.deleted,
                "Scaled executors"
            );
        }
        Ok(outcome)
    }

    /// Delete every child the index reports
    ///
    /// Returns the number of children still present, including those
    /// already terminating. All deletions are attempted; the first failure
    /// is returned after the rest have been issued.
    pub async fn delete_children(&self, owner: &OwnerRef) -> Result<usize> {
        let children = self.index.children_of(owner)?;
        self.delete_all(owner, &children).await?;
        Ok(self.index.children_of(owner)?.len())
    }

    /// Delete every pod in `pods` that is not already terminating
    pub async fn delete_all(&self, owner: &OwnerRef, pods: &[Pod]) -> Result<()> {
        let mut first_error = None;

        for pod in pods.iter().filter(|p| !is_terminating(p)) {
            if let Err(e) = self.delete(owner, pod).await {
                warn!(cluster = %owner, pod = %pod.name_any(), error = %e, "Failed to delete child pod");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn create(&self, owner: &OwnerRef, pod: &Pod) -> Result<()> {
        let name = pod.name_any();
        let action = format!("create pod {name}");

        let created = retry_on(&self.retry, &action, Error::is_conflict, || {
            self.kube.create_pod(&owner.namespace, pod)
        })
        .await
        .map_err(|e| e.for_action(&owner.name, &action))?;

        self.index.record_applied(&created);
        Ok(())
    }

    async fn delete(&self, owner: &OwnerRef, pod: &Pod) -> Result<()> {
        let name = pod.name_any();
        let action = format!("delete pod {name}");
        let uid = pod.uid();

        let result = retry_on(&self.retry, &action, Error::is_conflict, || {
            self.kube.delete_pod(&owner.namespace, &name, uid.clone())
        })
        .await;

        match result {
            Ok(Some(terminating)) => self.index.record_applied(&terminating),
            Ok(None) => self.index.record_deleted(pod),
            Err(e) if e.is_not_found() => self.index.record_deleted(pod),
            Err(e) => return Err(e.for_action(&owner.name, &action)),
        }
        debug!(cluster = %owner, pod = %name, "Deleted pod");
        Ok(())
    }
}
