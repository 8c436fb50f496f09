//! End-to-end reconciliation flows against an in-memory API server
//!
//! These tests drive `reconcile` round by round with the real owner/role
//! index and child manager. Only the API server is faked: pods are created
//! and deleted instantly, and readiness is flipped by the test.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Event;
use kube::ResourceExt;

use ballista_operator::config::OperatorConfig;
use ballista_operator::controller::{conditions, reconcile, Context, KubeClient};
use ballista_operator::crd::{
    BallistaCluster, BallistaClusterSpec, BallistaClusterStatus, ClusterState, ConditionStatus,
    ExecutorSpec,
};
use ballista_operator::events::NoopEventPublisher;
use ballista_operator::index::{owner_of, role_of, OwnerRoleIndex};
use ballista_operator::{Error, CLEANUP_FINALIZER, CLUSTER_LABEL, ROLE_LABEL};

const NAMESPACE: &str = "analytics";

// =============================================================================
// Fake API server
// =============================================================================

#[derive(Default)]
struct Store {
    cluster: Option<BallistaCluster>,
    pods: BTreeMap<String, Pod>,
    resource_version: u64,
    next_uid: u64,
    ops: Vec<String>,
}

impl Store {
    fn bump(&mut self) -> String {
        self.resource_version += 1;
        let rv = self.resource_version.to_string();
        if let Some(cluster) = self.cluster.as_mut() {
            cluster.metadata.resource_version = Some(rv.clone());
        }
        rv
    }
}

#[derive(Clone, Default)]
struct FakeApiServer {
    store: Arc<Mutex<Store>>,
}

impl FakeApiServer {
    fn with_cluster(instances: i32) -> Self {
        let server = Self::default();
        {
            let mut store = server.store.lock().unwrap();
            let mut cluster = BallistaCluster::new(
                "demo",
                BallistaClusterSpec {
                    ballista_version: "0.12.0".to_string(),
                    image: None,
                    scheduler: Default::default(),
                    executor: ExecutorSpec {
                        instances,
                        ..Default::default()
                    },
                },
            );
            cluster.metadata.namespace = Some(NAMESPACE.to_string());
            cluster.metadata.uid = Some("cluster-uid-1".to_string());
            cluster.metadata.generation = Some(1);
            store.cluster = Some(cluster);
            store.bump();
        }
        server
    }

    fn cluster(&self) -> Option<BallistaCluster> {
        self.store.lock().unwrap().cluster.clone()
    }

    fn status(&self) -> BallistaClusterStatus {
        self.cluster()
            .and_then(|c| c.status)
            .unwrap_or_default()
    }

    fn resource_version(&self) -> u64 {
        self.store.lock().unwrap().resource_version
    }

    fn pod_names(&self) -> Vec<String> {
        self.store.lock().unwrap().pods.keys().cloned().collect()
    }

    fn pods(&self) -> Vec<Pod> {
        self.store.lock().unwrap().pods.values().cloned().collect()
    }

    fn ops(&self) -> Vec<String> {
        self.store.lock().unwrap().ops.clone()
    }

    fn clear_ops(&self) {
        self.store.lock().unwrap().ops.clear();
    }

    fn set_instances(&self, instances: i32) {
        let mut store = self.store.lock().unwrap();
        if let Some(cluster) = store.cluster.as_mut() {
            cluster.spec.executor.instances = instances;
            cluster.metadata.generation = cluster.metadata.generation.map(|g| g + 1);
        }
        store.bump();
    }

    fn request_deletion(&self) {
        let mut store = self.store.lock().unwrap();
        if let Some(cluster) = store.cluster.as_mut() {
            cluster.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        store.bump();
    }

    /// Mark every pod Running and Ready, as the kubelet would
    fn make_all_ready(&self) -> Vec<Pod> {
        let mut store = self.store.lock().unwrap();
        for pod in store.pods.values_mut() {
            pod.status = Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
        store.pods.values().cloned().collect()
    }

    /// Insert a pod directly, bypassing the operator
    fn insert_pod(&self, pod: Pod) {
        let mut store = self.store.lock().unwrap();
        store.pods.insert(pod.name_any(), pod);
    }
}

#[async_trait]
impl KubeClient for FakeApiServer {
    async fn get_cluster(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<Option<BallistaCluster>, Error> {
        Ok(self.cluster())
    }

    async fn patch_status(
        &self,
        _namespace: &str,
        name: &str,
        status: &BallistaClusterStatus,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        let mut store = self.store.lock().unwrap();
        let current = store.resource_version.to_string();
        let Some(cluster) = store.cluster.as_mut() else {
            return Err(Error::NotFound(name.to_string()));
        };
        if resource_version.is_some_and(|rv| rv != current) {
            return Err(Error::Conflict(format!("{name} has been modified")));
        }
        cluster.status = Some(status.clone());
        store.ops.push("patch_status".to_string());
        store.bump();
        Ok(())
    }

    async fn add_finalizer(&self, _namespace: &str, name: &str, finalizer: &str) -> Result<(), Error> {
        let mut store = self.store.lock().unwrap();
        let Some(cluster) = store.cluster.as_mut() else {
            return Err(Error::NotFound(name.to_string()));
        };
        cluster
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
        store.ops.push("add_finalizer".to_string());
        store.bump();
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        _namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut store = self.store.lock().unwrap();
        let Some(cluster) = store.cluster.as_mut() else {
            return Err(Error::NotFound(name.to_string()));
        };
        if let Some(finalizers) = cluster.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != finalizer);
        }
        let released = cluster.metadata.deletion_timestamp.is_some()
            && cluster.finalizers().is_empty();
        store.ops.push("remove_finalizer".to_string());
        if released {
            store.cluster = None;
        }
        store.bump();
        Ok(())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.store.lock().unwrap().pods.get(name).cloned())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let mut store = self.store.lock().unwrap();
        let name = pod.name_any();
        if store.pods.contains_key(&name) {
            return Err(Error::AlreadyExists(name));
        }
        store.next_uid += 1;
        let mut created = pod.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.uid = Some(format!("pod-uid-{}", store.next_uid));
        store.pods.insert(name.clone(), created.clone());
        store.ops.push(format!("create {name}"));
        Ok(created)
    }

    async fn delete_pod(
        &self,
        _namespace: &str,
        name: &str,
        uid: Option<String>,
    ) -> Result<Option<Pod>, Error> {
        let mut store = self.store.lock().unwrap();
        let Some(existing) = store.pods.get(name) else {
            return Err(Error::NotFound(name.to_string()));
        };
        if uid.is_some() && existing.metadata.uid != uid {
            return Err(Error::Conflict(format!("uid precondition failed for {name}")));
        }
        store.pods.remove(name);
        store.ops.push(format!("delete {name}"));
        Ok(None)
    }

    async fn list_pods(&self, _namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error> {
        let (key, value) = label_selector
            .split_once('=')
            .ok_or_else(|| Error::transient(format!("unsupported selector {label_selector}")))?;
        Ok(self
            .pods()
            .into_iter()
            .filter(|p| p.labels().get(key).map(String::as_str) == Some(value))
            .collect())
    }
}

// =============================================================================
// Harness
// =============================================================================

fn synced_index() -> Arc<OwnerRoleIndex> {
    let index = Arc::new(OwnerRoleIndex::new(
        owner_of,
        role_of,
        Duration::from_secs(60),
    ));
    index.apply_event(Event::Init);
    index.apply_event(Event::InitDone);
    index
}

fn context(server: &FakeApiServer, index: Arc<OwnerRoleIndex>) -> Arc<Context> {
    Arc::new(Context::from_parts(
        Arc::new(server.clone()),
        index,
        Arc::new(NoopEventPublisher),
        OperatorConfig::default(),
    ))
}

async fn run(server: &FakeApiServer, ctx: &Arc<Context>) -> Action {
    let cluster = server.cluster().expect("cluster should exist");
    reconcile(Arc::new(cluster), ctx.clone())
        .await
        .expect("reconcile should succeed")
}

/// Mark pods ready and deliver the change to the index as a watch event would
fn kubelet_tick(server: &FakeApiServer, index: &OwnerRoleIndex) {
    for pod in server.make_all_ready() {
        index.apply_event(Event::Apply(pod));
    }
}

/// Drive a fresh cluster to Running
async fn converge(server: &FakeApiServer, ctx: &Arc<Context>, index: &OwnerRoleIndex) {
    for _ in 0..8 {
        run(server, ctx).await;
        kubelet_tick(server, index);
        if server.status().state == ClusterState::Running {
            return;
        }
    }
    panic!("cluster did not converge: {:?}", server.status());
}

// =============================================================================
// Stories
// =============================================================================

/// Story: A new cluster goes New -> Pending -> Running with one scheduler and N executors
#[tokio::test]
async fn story_cluster_converges_to_running() {
    let server = FakeApiServer::with_cluster(2);
    let index = synced_index();
    let ctx = context(&server, index.clone());

    // Finalizer first, nothing else
    assert_eq!(run(&server, &ctx).await, Action::requeue(Duration::from_secs(1)));
    assert!(server.pod_names().is_empty());
    assert_eq!(server.cluster().unwrap().finalizers(), &[CLEANUP_FINALIZER.to_string()]);

    // Scheduler
    assert_eq!(run(&server, &ctx).await, Action::requeue(Duration::ZERO));
    assert_eq!(server.status().state, ClusterState::Pending);
    assert_eq!(server.pod_names(), vec!["demo-scheduler"]);

    // Executors
    run(&server, &ctx).await;
    assert_eq!(
        server.pod_names(),
        vec!["demo-executor-0", "demo-executor-1", "demo-scheduler"]
    );
    assert_eq!(server.status().state, ClusterState::Pending);

    kubelet_tick(&server, &index);
    assert_eq!(run(&server, &ctx).await, Action::await_change());

    let status = server.status();
    assert_eq!(status.state, ClusterState::Running);
    assert!(status.scheduler_ready);
    assert_eq!(status.executors_ready, 2);
    assert_eq!(status.executors_desired, 2);
}

/// Story: Reconciling a converged cluster issues no writes at all
#[tokio::test]
async fn story_converged_cluster_is_left_alone() {
    let server = FakeApiServer::with_cluster(3);
    let index = synced_index();
    let ctx = context(&server, index.clone());
    converge(&server, &ctx, &index).await;

    server.clear_ops();
    let rv = server.resource_version();
    for _ in 0..3 {
        assert_eq!(run(&server, &ctx).await, Action::await_change());
    }

    assert!(server.ops().is_empty(), "unexpected writes: {:?}", server.ops());
    assert_eq!(server.resource_version(), rv);
}

/// Story: Scaling 3 -> 1 deletes the highest ordinals first and settles in Running
#[tokio::test]
async fn story_scale_down_removes_highest_ordinals() {
    let server = FakeApiServer::with_cluster(3);
    let index = synced_index();
    let ctx = context(&server, index.clone());
    converge(&server, &ctx, &index).await;

    server.clear_ops();
    server.set_instances(1);
    assert_eq!(run(&server, &ctx).await, Action::requeue(Duration::ZERO));
    assert_eq!(server.status().state, ClusterState::Pending);

    let deletes: Vec<String> = server
        .ops()
        .into_iter()
        .filter(|op| op.starts_with("delete"))
        .collect();
    assert_eq!(deletes, vec!["delete demo-executor-2", "delete demo-executor-1"]);

    assert_eq!(run(&server, &ctx).await, Action::await_change());
    let status = server.status();
    assert_eq!(status.state, ClusterState::Running);
    assert_eq!(status.executors_desired, 1);
    assert_eq!(status.observed_generation, Some(2));
}

/// Story: Scaling up creates exactly the missing ordinals
#[tokio::test]
async fn story_scale_up_fills_missing_ordinals() {
    let server = FakeApiServer::with_cluster(1);
    let index = synced_index();
    let ctx = context(&server, index.clone());
    converge(&server, &ctx, &index).await;

    server.clear_ops();
    server.set_instances(3);
    run(&server, &ctx).await;

    assert_eq!(
        server.ops().into_iter().filter(|op| op.starts_with("create")).collect::<Vec<_>>(),
        vec!["create demo-executor-1", "create demo-executor-2"]
    );
}

/// Story: Deleting the cluster removes all children before the finalizer is released
#[tokio::test]
async fn story_deletion_cleans_up_before_release() {
    let server = FakeApiServer::with_cluster(2);
    let index = synced_index();
    let ctx = context(&server, index.clone());
    converge(&server, &ctx, &index).await;

    server.clear_ops();
    server.request_deletion();
    assert_eq!(run(&server, &ctx).await, Action::await_change());

    let ops = server.ops();
    let release = ops
        .iter()
        .position(|op| op == "remove_finalizer")
        .expect("finalizer should be removed");
    let deletes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.starts_with("delete"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(deletes.len(), 3);
    assert!(deletes.iter().all(|&i| i < release));

    assert!(server.pod_names().is_empty());
    assert!(server.cluster().is_none());
}

/// Story: Pods that merely carry the labels are not children and survive deletion
#[tokio::test]
async fn story_unowned_pods_are_invisible() {
    let server = FakeApiServer::with_cluster(1);
    let index = synced_index();
    let ctx = context(&server, index.clone());

    // Same labels as an executor, but no controller owner reference
    let impostor = Pod {
        metadata: ObjectMeta {
            name: Some("demo-executor-5".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some("foreign-uid".to_string()),
            labels: Some(BTreeMap::from([
                (ROLE_LABEL.to_string(), "executor".to_string()),
                (CLUSTER_LABEL.to_string(), "demo".to_string()),
            ])),
            ..Default::default()
        },
        ..Default::default()
    };
    server.insert_pod(impostor.clone());
    index.apply_event(Event::Apply(impostor));

    converge(&server, &ctx, &index).await;
    assert_eq!(server.status().executors_ready, 1);
    assert!(!server.ops().iter().any(|op| op == "delete demo-executor-5"));

    server.request_deletion();
    run(&server, &ctx).await;
    assert_eq!(server.pod_names(), vec!["demo-executor-5"]);
    assert!(server.cluster().is_none());
}

/// Story: A foreign pod squatting on an executor name is surfaced and suspends the cluster
#[tokio::test]
async fn story_foreign_executor_name_is_surfaced_and_suspends() {
    let server = FakeApiServer::with_cluster(1);
    let index = synced_index();
    let ctx = context(&server, index.clone());

    let squatter = Pod {
        metadata: ObjectMeta {
            name: Some("demo-executor-0".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some("foreign-uid".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    server.insert_pod(squatter);

    let mut actions = Vec::new();
    for _ in 0..10 {
        let action = run(&server, &ctx).await;
        actions.push(action.clone());
        if action == Action::await_change() {
            break;
        }
    }

    // Finalizer, then the scheduler, then one failed executor create per round
    assert_eq!(actions.last(), Some(&Action::await_change()));
    assert!(
        !actions[2..].contains(&Action::requeue(Duration::ZERO)),
        "a name collision must not spin: {actions:?}"
    );
    assert_eq!(server.pod_names(), vec!["demo-executor-0", "demo-scheduler"]);

    let status = server.status();
    assert_eq!(status.action_failures, ctx.config.max_action_failures);
    let actions_succeeding = status
        .conditions
        .iter()
        .find(|c| c.type_ == conditions::ACTIONS_SUCCEEDING)
        .expect("ActionsSucceeding condition");
    assert_eq!(actions_succeeding.status, ConditionStatus::False);
    assert!(actions_succeeding.message.contains("demo-executor-0"));

    // The foreign pod is never touched
    assert!(!server.ops().iter().any(|op| op == "delete demo-executor-0"));
    let kept = server.pods().into_iter().find(|p| p.name_any() == "demo-executor-0");
    assert_eq!(kept.and_then(|p| p.metadata.uid).as_deref(), Some("foreign-uid"));

    // Suspended until the spec changes
    assert_eq!(run(&server, &ctx).await, Action::await_change());
}

/// Story: An operator restart with an unsynced index reports Unknown, then recovers
#[tokio::test]
async fn story_unsynced_index_reports_unknown_then_recovers() {
    let server = FakeApiServer::with_cluster(2);
    let index = synced_index();
    let ctx = context(&server, index.clone());
    converge(&server, &ctx, &index).await;

    // Restart: fresh index that has not listed yet
    let restarted = Arc::new(OwnerRoleIndex::new(
        owner_of,
        role_of,
        Duration::from_secs(60),
    ));
    let ctx = context(&server, restarted.clone());
    server.clear_ops();

    let action = run(&server, &ctx).await;
    assert_eq!(action, Action::requeue(ctx.config.requeue_pending));
    assert_eq!(server.status().state, ClusterState::Unknown);
    assert!(
        !server.ops().iter().any(|op| op.starts_with("create") || op.starts_with("delete")),
        "no child actions without an observation"
    );

    // Initial list completes
    restarted.apply_event(Event::Init);
    for pod in server.pods() {
        restarted.apply_event(Event::InitApply(pod));
    }
    restarted.apply_event(Event::InitDone);

    assert_eq!(run(&server, &ctx).await, Action::await_change());
    assert_eq!(server.status().state, ClusterState::Running);
}

/// Story: An invalid spec is reported and no pods are created
#[tokio::test]
async fn story_invalid_spec_creates_nothing() {
    let server = FakeApiServer::with_cluster(1);
    {
        let mut store = server.store.lock().unwrap();
        if let Some(cluster) = store.cluster.as_mut() {
            cluster.spec.ballista_version = String::new();
        }
    }
    let index = synced_index();
    let ctx = context(&server, index);

    run(&server, &ctx).await; // finalizer
    assert_eq!(run(&server, &ctx).await, Action::await_change());

    let status = server.status();
    assert_eq!(status.state, ClusterState::Unknown);
    assert!(status
        .message
        .as_deref()
        .is_some_and(|m| m.contains("ballistaVersion")));
    assert!(server.pod_names().is_empty());
}
