//! Kubernetes client wrapper for kubefault
//!
//! [`ClusterApi`] is the seam between the engine and the API server; the
//! production implementation is [`K8sClient`].

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
#[cfg(test)]
use mockall::automock;
use kube::{
    api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams},
    Client, Config,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::error::ClusterError;

/// Workloads whose replica count can be changed through the scale subresource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

/// Operations the cache and action engine need from the API server.
///
/// Every method reports failures as a classified [`ClusterError`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError>;
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;
    async fn list_deployments(&self) -> Result<Vec<Deployment>, ClusterError>;
    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>, ClusterError>;
    async fn list_stateful_sets(&self) -> Result<Vec<StatefulSet>, ClusterError>;
    async fn list_replica_sets(&self) -> Result<Vec<ReplicaSet>, ClusterError>;

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;

    /// Replace the node's taint list. With `resource_version` set the write
    /// fails with [`ClusterError::Conflict`] if the node changed meanwhile.
    async fn set_node_taints(
        &self,
        name: &str,
        resource_version: Option<String>,
        taints: Vec<Taint>,
    ) -> Result<(), ClusterError>;

    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool)
        -> Result<(), ClusterError>;

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>, ClusterError>;

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<(), ClusterError>;

    /// Evict through the eviction subresource; disruption budgets answer 429.
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Deployment, ClusterError>;

    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<StatefulSet, ClusterError>;

    async fn scale_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ClusterError>;

    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn server_version(&self) -> Result<String, ClusterError>;
}

/// Wrapper around kube::Client implementing [`ClusterApi`]
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Create a new K8sClient using the default kubeconfig or in-cluster config
    #[instrument(skip_all)]
    pub async fn new() -> anyhow::Result<Self> {
        let config = Config::infer().await?;
        let client = Client::try_from(config)?;

        info!("Connected to Kubernetes cluster");

        Ok(Self { client })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

fn classify<'a>(kind: &'a str, name: &'a str) -> impl FnOnce(kube::Error) -> ClusterError + 'a {
    move |e| ClusterError::from_kube(e, kind, name)
}

#[async_trait]
impl ClusterApi for K8sClient {
    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(classify("PodList", "*"))?;
        Ok(list.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        let list = self
            .nodes()
            .list(&ListParams::default())
            .await
            .map_err(classify("NodeList", "*"))?;
        Ok(list.items)
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>, ClusterError> {
        let api: Api<Deployment> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(classify("DeploymentList", "*"))?;
        Ok(list.items)
    }

    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>, ClusterError> {
        let api: Api<DaemonSet> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(classify("DaemonSetList", "*"))?;
        Ok(list.items)
    }

    async fn list_stateful_sets(&self) -> Result<Vec<StatefulSet>, ClusterError> {
        let api: Api<StatefulSet> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(classify("StatefulSetList", "*"))?;
        Ok(list.items)
    }

    async fn list_replica_sets(&self) -> Result<Vec<ReplicaSet>, ClusterError> {
        let api: Api<ReplicaSet> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(classify("ReplicaSetList", "*"))?;
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        self.nodes().get(name).await.map_err(classify("Node", name))
    }

    #[instrument(skip(self, taints), fields(taint_count = taints.len()))]
    async fn set_node_taints(
        &self,
        name: &str,
        resource_version: Option<String>,
        taints: Vec<Taint>,
    ) -> Result<(), ClusterError> {
        let mut patch = json!({ "spec": { "taints": taints } });
        if let Some(rv) = resource_version {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(classify("Node", name))?;
        info!("Updated node taints");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_node_unschedulable(
        &self,
        name: &str,
        unschedulable: bool,
    ) -> Result<(), ClusterError> {
        let nodes = self.nodes();
        let result = if unschedulable {
            nodes.cordon(name).await
        } else {
            nodes.uncordon(name).await
        };
        result.map_err(classify("Node", name))?;
        info!("Updated node schedulability");
        Ok(())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("spec.nodeName={}", node));
        let list = api.list(&lp).await.map_err(classify("PodList", node))?;
        Ok(list.items)
    }

    #[instrument(skip(self))]
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<(), ClusterError> {
        let dp = DeleteParams {
            grace_period_seconds,
            ..DeleteParams::default()
        };
        self.pods(namespace)
            .delete(name, &dp)
            .await
            .map_err(classify("Pod", name))?;
        info!("Deleted pod");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.pods(namespace)
            .evict(name, &EvictParams::default())
            .await
            .map_err(classify("Pod", name))?;
        debug!("Evicted pod");
        Ok(())
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(classify("Deployment", name))
    }

    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<StatefulSet, ClusterError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(classify("StatefulSet", name))
    }

    #[instrument(skip(self))]
    async fn scale_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ClusterError> {
        let patch = json!({ "spec": { "replicas": replicas } });
        let pp = PatchParams::default();
        let kind_name = kind.to_string();
        match kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                api.patch_scale(name, &pp, &Patch::Merge(&patch))
                    .await
                    .map_err(classify(&kind_name, name))?;
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                api.patch_scale(name, &pp, &Patch::Merge(&patch))
                    .await
                    .map_err(classify(&kind_name, name))?;
            }
        }
        info!("Scaled workload");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.restart(name)
            .await
            .map_err(classify("Deployment", name))?;
        info!("Triggered rollout restart");
        Ok(())
    }

    async fn server_version(&self) -> Result<String, ClusterError> {
        let version = self
            .client
            .apiserver_version()
            .await
            .map_err(classify("Version", "apiserver"))?;
        Ok(version.git_version)
    }
}
