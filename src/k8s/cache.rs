//! Cluster snapshot cache
//!
//! Holds the last successful full listing of every kind discovery and the
//! action engine read. Each kind lives in its own slot as an
//! `Arc<KindListing<_>>`; a refresh builds the new listing off to the side
//! and swaps the `Arc`, so readers see either the old or the new listing of
//! a kind and never a mix. A failed refresh keeps the previous listing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::ClusterApi;
use super::owners::{self, OwnerRef};
use super::selector;
use crate::error::ClusterError;

/// Kinds held by the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ResourceKind {
    Pod,
    Node,
    Deployment,
    DaemonSet,
    StatefulSet,
    ReplicaSet,
}

/// A sorted listing of one kind with a `(namespace, name)` index
#[derive(Debug)]
pub struct KindListing<K> {
    items: Vec<K>,
    by_key: HashMap<(String, String), usize>,
    by_group: HashMap<String, Vec<usize>>,
}

impl<K: CachedResource> KindListing<K> {
    pub fn new(mut items: Vec<K>) -> Self {
        items.sort_by(|a, b| {
            (a.namespace().unwrap_or_default(), a.name_any())
                .cmp(&(b.namespace().unwrap_or_default(), b.name_any()))
        });

        let mut by_key = HashMap::with_capacity(items.len());
        let mut by_group: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, item) in items.iter().enumerate() {
            by_key.insert((item.namespace().unwrap_or_default(), item.name_any()), i);
            if let Some(group) = item.group_key() {
                by_group.entry(group.to_string()).or_default().push(i);
            }
        }

        Self {
            items,
            by_key,
            by_group,
        }
    }

    pub fn items(&self) -> &[K] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Cluster-scoped kinds use an empty namespace.
    pub fn get(&self, namespace: &str, name: &str) -> Option<&K> {
        self.by_key
            .get(&(namespace.to_string(), name.to_string()))
            .map(|&i| &self.items[i])
    }

    fn group(&self, key: &str) -> impl Iterator<Item = &K> {
        self.by_group
            .get(key)
            .into_iter()
            .flatten()
            .map(|&i| &self.items[i])
    }
}

impl<K: CachedResource> Default for KindListing<K> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// A Kubernetes type the cache can hold
pub trait CachedResource: kube::Resource + Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn slot(cache: &SnapshotCache) -> &RwLock<Arc<KindListing<Self>>>;

    fn listing(snapshot: &Snapshot) -> &Arc<KindListing<Self>>;

    fn listing_mut(snapshot: &mut Snapshot) -> &mut Arc<KindListing<Self>>;

    fn fetch(api: &dyn ClusterApi) -> BoxFuture<'_, Result<Vec<Self>, ClusterError>>;

    /// Secondary grouping key (pods group by node name)
    fn group_key(&self) -> Option<&str> {
        None
    }
}

macro_rules! cached_resource {
    ($ty:ty, $kind:expr, $field:ident, $fetch:ident) => {
        impl CachedResource for $ty {
            const KIND: ResourceKind = $kind;

            fn slot(cache: &SnapshotCache) -> &RwLock<Arc<KindListing<Self>>> {
                &cache.$field
            }

            fn listing(snapshot: &Snapshot) -> &Arc<KindListing<Self>> {
                &snapshot.$field
            }

            fn listing_mut(snapshot: &mut Snapshot) -> &mut Arc<KindListing<Self>> {
                &mut snapshot.$field
            }

            fn fetch(api: &dyn ClusterApi) -> BoxFuture<'_, Result<Vec<Self>, ClusterError>> {
                api.$fetch()
            }
        }
    };
}

cached_resource!(Node, ResourceKind::Node, nodes, list_nodes);
cached_resource!(Deployment, ResourceKind::Deployment, deployments, list_deployments);
cached_resource!(DaemonSet, ResourceKind::DaemonSet, daemon_sets, list_daemon_sets);
cached_resource!(StatefulSet, ResourceKind::StatefulSet, stateful_sets, list_stateful_sets);
cached_resource!(ReplicaSet, ResourceKind::ReplicaSet, replica_sets, list_replica_sets);

impl CachedResource for Pod {
    const KIND: ResourceKind = ResourceKind::Pod;

    fn slot(cache: &SnapshotCache) -> &RwLock<Arc<KindListing<Self>>> {
        &cache.pods
    }

    fn listing(snapshot: &Snapshot) -> &Arc<KindListing<Self>> {
        &snapshot.pods
    }

    fn listing_mut(snapshot: &mut Snapshot) -> &mut Arc<KindListing<Self>> {
        &mut snapshot.pods
    }

    fn fetch(api: &dyn ClusterApi) -> BoxFuture<'_, Result<Vec<Self>, ClusterError>> {
        api.list_pods()
    }

    fn group_key(&self) -> Option<&str> {
        self.spec.as_ref().and_then(|s| s.node_name.as_deref())
    }
}

/// A point-in-time view over every kind, cheap to clone.
///
/// All lookups are pure and never contact the API server.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub pods: Arc<KindListing<Pod>>,
    pub nodes: Arc<KindListing<Node>>,
    pub deployments: Arc<KindListing<Deployment>>,
    pub daemon_sets: Arc<KindListing<DaemonSet>>,
    pub stateful_sets: Arc<KindListing<StatefulSet>>,
    pub replica_sets: Arc<KindListing<ReplicaSet>>,
}

impl Snapshot {
    /// Replace one kind, e.g. when building fixtures
    pub fn with<K: CachedResource>(mut self, items: Vec<K>) -> Self {
        let listing = Arc::new(KindListing::new(items));
        *K::listing_mut(&mut self) = listing;
        self
    }

    pub fn list<K: CachedResource>(&self) -> &[K] {
        K::listing(self).items()
    }

    pub fn get<K: CachedResource>(&self, namespace: &str, name: &str) -> Option<&K> {
        K::listing(self).get(namespace, name)
    }

    /// Pods in `namespace` matching `selector`. A missing selector selects
    /// nothing; an empty one selects every pod in the namespace.
    pub fn pods_by_selector(&self, selector: Option<&LabelSelector>, namespace: &str) -> Vec<&Pod> {
        let Some(selector) = selector else {
            return Vec::new();
        };
        self.pods
            .items()
            .iter()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .filter(|pod| selector::matches(selector, pod.labels()))
            .collect()
    }

    pub fn pods_on_node(&self, node: &str) -> Vec<&Pod> {
        self.pods.group(node).collect()
    }

    /// Controllers transitively owning `meta`, nearest first
    pub fn resolve_owner_chain(&self, meta: &ObjectMeta) -> Vec<OwnerRef> {
        owners::resolve_owner_chain(self, meta)
    }
}

/// The shared, periodically refreshed cache
#[derive(Default)]
pub struct SnapshotCache {
    pods: RwLock<Arc<KindListing<Pod>>>,
    nodes: RwLock<Arc<KindListing<Node>>>,
    deployments: RwLock<Arc<KindListing<Deployment>>>,
    daemon_sets: RwLock<Arc<KindListing<DaemonSet>>>,
    stateful_sets: RwLock<Arc<KindListing<StatefulSet>>>,
    replica_sets: RwLock<Arc<KindListing<ReplicaSet>>>,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache pre-filled with `snapshot`, never refreshed yet
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            pods: RwLock::new(snapshot.pods),
            nodes: RwLock::new(snapshot.nodes),
            deployments: RwLock::new(snapshot.deployments),
            daemon_sets: RwLock::new(snapshot.daemon_sets),
            stateful_sets: RwLock::new(snapshot.stateful_sets),
            replica_sets: RwLock::new(snapshot.replica_sets),
            last_refresh: RwLock::new(None),
        }
    }

    /// Current listing of one kind
    pub async fn list<K: CachedResource>(&self) -> Arc<KindListing<K>> {
        K::slot(self).read().await.clone()
    }

    pub async fn get<K: CachedResource>(&self, namespace: &str, name: &str) -> Option<K> {
        self.list::<K>().await.get(namespace, name).cloned()
    }

    /// Collect the current listing of every kind
    pub async fn snapshot(&self) -> Snapshot {
        Snapshot {
            pods: self.list::<Pod>().await,
            nodes: self.list::<Node>().await,
            deployments: self.list::<Deployment>().await,
            daemon_sets: self.list::<DaemonSet>().await,
            stateful_sets: self.list::<StatefulSet>().await,
            replica_sets: self.list::<ReplicaSet>().await,
        }
    }

    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.read().await
    }

    /// Re-list one kind and swap it in. On failure the previous listing stays.
    pub async fn refresh_kind<K: CachedResource>(
        &self,
        api: &dyn ClusterApi,
    ) -> Result<usize, ClusterError> {
        let items = K::fetch(api).await.map_err(|e| {
            warn!(kind = %K::KIND, error = %e, "Cache refresh failed, keeping previous listing");
            e
        })?;
        let listing = Arc::new(KindListing::new(items));
        let count = listing.len();
        if listing.is_empty() {
            debug!(kind = %K::KIND, "Cluster returned no objects");
        }
        *K::slot(self).write().await = listing;
        debug!(kind = %K::KIND, count, "Cache kind refreshed");
        Ok(count)
    }

    /// Refresh every kind concurrently. Returns the kinds that failed.
    pub async fn refresh(&self, api: &dyn ClusterApi) -> Vec<(ResourceKind, ClusterError)> {
        let (pods, nodes, deployments, daemon_sets, stateful_sets, replica_sets) = futures::join!(
            self.refresh_kind::<Pod>(api),
            self.refresh_kind::<Node>(api),
            self.refresh_kind::<Deployment>(api),
            self.refresh_kind::<DaemonSet>(api),
            self.refresh_kind::<StatefulSet>(api),
            self.refresh_kind::<ReplicaSet>(api),
        );

        let failures: Vec<_> = [
            (ResourceKind::Pod, pods.err()),
            (ResourceKind::Node, nodes.err()),
            (ResourceKind::Deployment, deployments.err()),
            (ResourceKind::DaemonSet, daemon_sets.err()),
            (ResourceKind::StatefulSet, stateful_sets.err()),
            (ResourceKind::ReplicaSet, replica_sets.err()),
        ]
        .into_iter()
        .filter_map(|(kind, err)| err.map(|e| (kind, e)))
        .collect();

        if failures.is_empty() {
            *self.last_refresh.write().await = Some(Utc::now());
        }
        failures
    }

    /// Refresh on a fixed interval until the task is aborted
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        api: Arc<dyn ClusterApi>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Starting cluster cache refresh loop");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let failures = self.refresh(api.as_ref()).await;
                if !failures.is_empty() {
                    warn!(failed_kinds = failures.len(), "Cache refresh incomplete");
                }
            }
        })
    }
}
