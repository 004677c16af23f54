//! In-memory cluster shared by the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    DaemonSet, Deployment, DeploymentSpec, DeploymentStatus, ReplicaSet, StatefulSet,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, Node, NodeSpec, Pod, PodSpec, PodStatus, Taint,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::ResourceExt;

use kubefault::config::Config;
use kubefault::error::ClusterError;
use kubefault::k8s::{ClusterApi, SnapshotCache, WorkloadKind};

#[derive(Default)]
pub struct ClusterState {
    pub pods: Vec<Pod>,
    pub nodes: Vec<Node>,
    pub deployments: Vec<Deployment>,
    pub daemon_sets: Vec<DaemonSet>,
    pub stateful_sets: Vec<StatefulSet>,
    pub replica_sets: Vec<ReplicaSet>,
    /// Every mutating call, e.g. `scale default/web 3`
    pub calls: Vec<String>,
    /// Evictions never return, like a PodDisruptionBudget that never clears
    pub hang_evictions: bool,
}

/// A [`ClusterApi`] backed by plain vectors
#[derive(Clone, Default)]
pub struct FakeCluster {
    pub state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, f: impl FnOnce(&mut ClusterState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn node(&self, name: &str) -> Node {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .iter()
            .find(|n| n.name_any() == name)
            .cloned()
            .unwrap()
    }

    pub fn taints(&self, node: &str) -> Vec<Taint> {
        self.node(node)
            .spec
            .and_then(|s| s.taints)
            .unwrap_or_default()
    }

    pub fn replicas(&self, namespace: &str, name: &str) -> Option<i32> {
        let state = self.state.lock().unwrap();
        state
            .deployments
            .iter()
            .find(|d| d.namespace().as_deref() == Some(namespace) && d.name_any() == name)
            .and_then(|d| d.spec.as_ref().and_then(|s| s.replicas))
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pods
            .iter()
            .map(|p| p.name_any())
            .collect()
    }
}

fn bump_version(meta: &mut ObjectMeta) {
    let next = meta
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    meta.resource_version = Some(next.to_string());
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError> {
        Ok(self.state.lock().unwrap().pods.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>, ClusterError> {
        Ok(self.state.lock().unwrap().deployments.clone())
    }

    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>, ClusterError> {
        Ok(self.state.lock().unwrap().daemon_sets.clone())
    }

    async fn list_stateful_sets(&self) -> Result<Vec<StatefulSet>, ClusterError> {
        Ok(self.state.lock().unwrap().stateful_sets.clone())
    }

    async fn list_replica_sets(&self) -> Result<Vec<ReplicaSet>, ClusterError> {
        Ok(self.state.lock().unwrap().replica_sets.clone())
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .iter()
            .find(|n| n.name_any() == name)
            .cloned()
            .ok_or_else(|| ClusterError::not_found("Node", name))
    }

    async fn set_node_taints(
        &self,
        name: &str,
        resource_version: Option<String>,
        taints: Vec<Taint>,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        let node = state
            .nodes
            .iter_mut()
            .find(|n| n.name_any() == name)
            .ok_or_else(|| ClusterError::not_found("Node", name))?;
        if resource_version.is_some() && resource_version != node.metadata.resource_version {
            return Err(ClusterError::Conflict("node changed".to_string()));
        }
        node.spec.get_or_insert_with(NodeSpec::default).taints = Some(taints);
        bump_version(&mut node.metadata);
        state.calls.push(format!("taints {}", name));
        Ok(())
    }

    async fn set_node_unschedulable(
        &self,
        name: &str,
        unschedulable: bool,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        let node = state
            .nodes
            .iter_mut()
            .find(|n| n.name_any() == name)
            .ok_or_else(|| ClusterError::not_found("Node", name))?;
        node.spec.get_or_insert_with(NodeSpec::default).unschedulable = Some(unschedulable);
        bump_version(&mut node.metadata);
        state.calls.push(format!("unschedulable {} {}", name, unschedulable));
        Ok(())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node))
            .cloned()
            .collect())
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        _grace_period_seconds: Option<u32>,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        let before = state.pods.len();
        state
            .pods
            .retain(|p| !(p.namespace().as_deref() == Some(namespace) && p.name_any() == name));
        if state.pods.len() == before {
            return Err(ClusterError::not_found("Pod", name));
        }
        state.calls.push(format!("delete {}/{}", namespace, name));
        Ok(())
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let hang = self.state.lock().unwrap().hang_evictions;
        if hang {
            std::future::pending::<()>().await;
        }
        self.delete_pod(namespace, name, None).await?;
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("evict {}/{}", namespace, name));
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, ClusterError> {
        let state = self.state.lock().unwrap();
        state
            .deployments
            .iter()
            .find(|d| d.namespace().as_deref() == Some(namespace) && d.name_any() == name)
            .cloned()
            .ok_or_else(|| ClusterError::not_found("Deployment", name))
    }

    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<StatefulSet, ClusterError> {
        let state = self.state.lock().unwrap();
        state
            .stateful_sets
            .iter()
            .find(|s| s.namespace().as_deref() == Some(namespace) && s.name_any() == name)
            .cloned()
            .ok_or_else(|| ClusterError::not_found("StatefulSet", name))
    }

    async fn scale_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        match kind {
            WorkloadKind::Deployment => {
                let deployment = state
                    .deployments
                    .iter_mut()
                    .find(|d| d.namespace().as_deref() == Some(namespace) && d.name_any() == name)
                    .ok_or_else(|| ClusterError::not_found("Deployment", name))?;
                deployment
                    .spec
                    .get_or_insert_with(DeploymentSpec::default)
                    .replicas = Some(replicas);
            }
            WorkloadKind::StatefulSet => {
                let set = state
                    .stateful_sets
                    .iter_mut()
                    .find(|s| s.namespace().as_deref() == Some(namespace) && s.name_any() == name)
                    .ok_or_else(|| ClusterError::not_found("StatefulSet", name))?;
                if let Some(spec) = set.spec.as_mut() {
                    spec.replicas = Some(replicas);
                }
            }
        }
        state
            .calls
            .push(format!("scale {}/{} {}", namespace, name, replicas));
        Ok(())
    }

    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        let deployment = state
            .deployments
            .iter_mut()
            .find(|d| d.namespace().as_deref() == Some(namespace) && d.name_any() == name)
            .ok_or_else(|| ClusterError::not_found("Deployment", name))?;
        deployment.metadata.generation = Some(deployment.metadata.generation.unwrap_or(1) + 1);
        state.calls.push(format!("restart {}/{}", namespace, name));
        Ok(())
    }

    async fn server_version(&self) -> Result<String, ClusterError> {
        Ok("v1.28.3".to_string())
    }
}

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            labels: Some(labels(&[("kubernetes.io/hostname", name)])),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        ..Default::default()
    }
}

/// A running pod with one container whose id is `containerd://<name>-c`
pub fn pod(namespace: &str, name: &str, node: &str, pod_labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(pod_labels)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            containers: vec![Container {
                name: "app".to_string(),
                image: Some("nginx:1.25".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "app".to_string(),
                container_id: Some(format!("containerd://{}-c", name)),
                image: "nginx:1.25".to_string(),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn owned_by(mut pod: Pod, kind: &str, name: &str) -> Pod {
    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("{}-uid", name),
        controller: Some(true),
        ..Default::default()
    }]);
    pod
}

pub fn replica_set(namespace: &str, name: &str, deployment: &str) -> ReplicaSet {
    ReplicaSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: deployment.to_string(),
                uid: format!("{}-uid", deployment),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A fully rolled-out deployment selecting `app=<name>`
pub fn deployment(namespace: &str, name: &str, replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(&[("app", name)])),
            generation: Some(1),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels(&[("app", name)])),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            observed_generation: Some(1),
            replicas: Some(replicas),
            updated_replicas: Some(replicas),
            available_replicas: Some(replicas),
            ready_replicas: Some(replicas),
            ..Default::default()
        }),
    }
}

/// One node running deployment `web` (two pods, one ReplicaSet) in `default`
pub fn web_cluster() -> FakeCluster {
    FakeCluster::new().with(|s| {
        s.nodes.push(node("worker-1"));
        s.deployments.push(deployment("default", "web", 2));
        s.replica_sets.push(replica_set("default", "web-7d9f", "web"));
        for name in ["web-7d9f-a", "web-7d9f-b"] {
            s.pods.push(owned_by(
                pod("default", name, "worker-1", &[("app", "web"), ("tier", "frontend")]),
                "ReplicaSet",
                "web-7d9f",
            ));
        }
    })
}

pub fn test_config() -> Config {
    Config {
        cluster_name: "test-cluster".to_string(),
        action_poll_interval_ms: 100,
        ..Config::default()
    }
}

/// Cache already refreshed from `cluster`
pub async fn warm_cache(cluster: &FakeCluster) -> Arc<SnapshotCache> {
    let cache = Arc::new(SnapshotCache::new());
    let failures = cache.refresh(cluster).await;
    assert!(failures.is_empty());
    cache
}
