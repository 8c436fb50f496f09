//! Owner/role index over child pods
//!
//! The index answers "which pods belong to this BallistaCluster, and in which
//! role" without listing pods on every reconciliation. It is built from two
//! extraction functions registered once at construction; a pod for which
//! either function returns `None` is invisible to every query.
//!
//! The index is fed by [`index_pods`] and by the child manager's
//! read-your-writes updates. Until the first full list has been applied, or
//! while the watcher has been failing for longer than the staleness window,
//! queries fail with an observation error instead of returning an empty set.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Event};
use kube::{Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::crd::{BallistaCluster, Role};
use crate::{Error, Result, ROLE_LABEL};

/// Server-side watch timeout in seconds
///
/// Kept below the client's read timeout so an idle watch is closed by the
/// API server and restarted, not dropped as a client error.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Identity of the cluster that controls a pod
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerRef {
    /// Namespace shared by the cluster and its pods
    pub namespace: String,
    /// Cluster name
    pub name: String,
    /// Cluster UID; a recreated cluster with the same name is a different owner
    pub uid: String,
}

impl OwnerRef {
    /// Owner identity of a live cluster object
    pub fn of(cluster: &BallistaCluster) -> Result<Self> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().ok_or_else(|| {
            Error::internal_with_context("index", format!("cluster {name} has no namespace"))
        })?;
        let uid = cluster.uid().ok_or_else(|| {
            Error::internal_with_context("index", format!("cluster {name} has no uid"))
        })?;
        Ok(Self {
            namespace,
            name,
            uid,
        })
    }
}

impl std::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Extracts the owning cluster of a pod
pub type OwnerFn = fn(&Pod) -> Option<OwnerRef>;

/// Extracts the role of a pod
pub type RoleFn = fn(&Pod) -> Option<Role>;

/// Controller owner reference pointing at a BallistaCluster
pub fn owner_of(pod: &Pod) -> Option<OwnerRef> {
    let namespace = pod.namespace()?;
    let api_version = BallistaCluster::api_version(&());
    let kind = BallistaCluster::kind(&());

    pod.owner_references()
        .iter()
        .find(|r| r.controller == Some(true) && r.kind == kind && r.api_version == api_version)
        .map(|r| OwnerRef {
            namespace,
            name: r.name.clone(),
            uid: r.uid.clone(),
        })
}

/// Role label of a pod
pub fn role_of(pod: &Pod) -> Option<Role> {
    pod.labels().get(ROLE_LABEL).and_then(|v| Role::parse(v))
}

/// Query surface of the child index
#[cfg_attr(test, automock)]
pub trait ChildIndex: Send + Sync {
    /// All pods controlled by `owner`, sorted by name
    fn children_of(&self, owner: &OwnerRef) -> Result<Vec<Pod>>;

    /// Pods controlled by `owner` with the given role, sorted by name
    fn children_of_role(&self, owner: &OwnerRef, role: Role) -> Result<Vec<Pod>>;

    /// Record a pod returned by a successful create or graceful delete
    fn record_applied(&self, pod: &Pod);

    /// Record that a pod is gone
    fn record_deleted(&self, pod: &Pod);
}

type PodKey = (String, String);

struct Entry {
    owner: OwnerRef,
    role: Role,
    pod: Pod,
}

#[derive(Default)]
struct IndexState {
    pods: HashMap<PodKey, Entry>,
    by_owner: HashMap<OwnerRef, BTreeSet<PodKey>>,
    synced: bool,
    /// Set on the first watch error, cleared by the next successful event
    unhealthy_since: Option<Instant>,
    /// Pods collected between `Init` and `InitDone` of a relist
    relist: Option<Vec<Pod>>,
}

impl IndexState {
    fn upsert(&mut self, owner_of: OwnerFn, role_of: RoleFn, pod: Pod) {
        let Some(key) = pod_key(&pod) else {
            return;
        };
        self.remove(&key);

        let (Some(owner), Some(role)) = (owner_of(&pod), role_of(&pod)) else {
            return;
        };
        self.by_owner
            .entry(owner.clone())
            .or_default()
            .insert(key.clone());
        self.pods.insert(key, Entry { owner, role, pod });
    }

    fn remove(&mut self, key: &PodKey) {
        if let Some(old) = self.pods.remove(key) {
            if let Some(keys) = self.by_owner.get_mut(&old.owner) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_owner.remove(&old.owner);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.pods.clear();
        self.by_owner.clear();
    }
}

fn pod_key(pod: &Pod) -> Option<PodKey> {
    Some((pod.namespace()?, pod.metadata.name.clone()?))
}

/// In-memory [`ChildIndex`] fed by watch events
pub struct OwnerRoleIndex {
    owner_of: OwnerFn,
    role_of: RoleFn,
    staleness: Duration,
    state: RwLock<IndexState>,
}

impl OwnerRoleIndex {
    /// Create an empty, unsynced index
    pub fn new(owner_of: OwnerFn, role_of: RoleFn, staleness: Duration) -> Self {
        Self {
            owner_of,
            role_of,
            staleness,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Apply one watcher event
    pub fn apply_event(&self, event: Event<Pod>) {
        let Ok(mut state) = self.state.write() else {
            warn!("pod index lock poisoned, dropping event");
            return;
        };
        state.unhealthy_since = None;

        match event {
            Event::Init => state.relist = Some(Vec::new()),
            Event::InitApply(pod) => match state.relist.as_mut() {
                Some(buffer) => buffer.push(pod),
                None => state.upsert(self.owner_of, self.role_of, pod),
            },
            Event::InitDone => {
                let pods = state.relist.take().unwrap_or_default();
                state.clear();
                for pod in pods {
                    state.upsert(self.owner_of, self.role_of, pod);
                }
                if !state.synced {
                    info!(pods = state.pods.len(), "pod index synced");
                }
                state.synced = true;
            }
            Event::Apply(pod) => state.upsert(self.owner_of, self.role_of, pod),
            Event::Delete(pod) => {
                if let Some(key) = pod_key(&pod) {
                    state.remove(&key);
                }
            }
        }
    }

    /// Record a watch failure; queries fail once it outlasts the staleness window
    pub fn mark_unhealthy(&self) {
        if let Ok(mut state) = self.state.write() {
            if state.unhealthy_since.is_none() {
                state.unhealthy_since = Some(Instant::now());
            }
        }
    }

    /// Whether the initial list has completed
    pub fn is_synced(&self) -> bool {
        self.state.read().map(|s| s.synced).unwrap_or(false)
    }

    fn query<F>(&self, owner: &OwnerRef, keep: F) -> Result<Vec<Pod>>
    where
        F: Fn(&Entry) -> bool,
    {
        let state = self
            .state
            .read()
            .map_err(|_| Error::observation("pod index lock poisoned"))?;

        if !state.synced {
            return Err(Error::observation("pod index has not completed its initial list"));
        }
        if let Some(since) = state.unhealthy_since {
            let elapsed = since.elapsed();
            if elapsed > self.staleness {
                return Err(Error::observation(format!(
                    "pod index out of sync for {}s",
                    elapsed.as_secs()
                )));
            }
        }

        let Some(keys) = state.by_owner.get(owner) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter_map(|key| state.pods.get(key))
            .filter(|entry| keep(entry))
            .map(|entry| entry.pod.clone())
            .collect())
    }
}

impl ChildIndex for OwnerRoleIndex {
    fn children_of(&self, owner: &OwnerRef) -> Result<Vec<Pod>> {
        self.query(owner, |_| true)
    }

    fn children_of_role(&self, owner: &OwnerRef, role: Role) -> Result<Vec<Pod>> {
        self.query(owner, |entry| entry.role == role)
    }

    fn record_applied(&self, pod: &Pod) {
        if let Ok(mut state) = self.state.write() {
            state.upsert(self.owner_of, self.role_of, pod.clone());
        }
    }

    fn record_deleted(&self, pod: &Pod) {
        if let (Ok(mut state), Some(key)) = (self.state.write(), pod_key(pod)) {
            state.remove(&key);
        }
    }
}

/// Watch configuration for pods carrying the role label
pub fn pod_watch_config() -> watcher::Config {
    watcher::Config::default()
        .labels(ROLE_LABEL)
        .timeout(WATCH_TIMEOUT_SECS)
}

/// Feed `index` from a pod watch stream, passing every event through
///
/// The returned stream is the single pod watch of the operator: the index
/// applies each event before the controller sees it, so a run triggered by a
/// pod change always finds that change in the index. Stream errors mark the
/// index unhealthy and are passed on for the consumer to log.
pub fn index_pods<S>(
    events: S,
    index: Arc<OwnerRoleIndex>,
) -> impl Stream<Item = std::result::Result<Event<Pod>, watcher::Error>> + Send
where
    S: Stream<Item = std::result::Result<Event<Pod>, watcher::Error>> + Send,
{
    events.inspect(move |event| match event {
        Ok(event) => index.apply_event(event.clone()),
        Err(e) => {
            warn!(error = %e, synced = index.is_synced(), "pod watch failed");
            index.mark_unhealthy();
        }
    })
}
