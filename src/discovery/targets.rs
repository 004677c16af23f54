//! Per-kind target construction

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use super::attributes::{container_statuses, strip_container_id, Attributes};
use super::exclusion::is_excluded;
use super::{Target, TargetKind};
use crate::config::Config;
use crate::k8s::Snapshot;

fn namespaced_id(config: &Config, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", config.cluster_name, namespace, name)
}

fn owner_attributes(attrs: &mut Attributes, snapshot: &Snapshot, meta: &ObjectMeta) {
    for owner in snapshot.resolve_owner_chain(meta) {
        attrs.set(format!("k8s.{}", owner.kind), owner.name);
    }
}

pub(super) fn pods(snapshot: &Snapshot, config: &Config) -> Vec<Target> {
    snapshot
        .list::<Pod>()
        .iter()
        .filter(|pod| !is_excluded(&pod.metadata, config))
        .map(|pod| {
            let name = pod.name_any();
            let namespace = pod.namespace().unwrap_or_default();
            let mut attrs = Attributes::new();
            attrs
                .set("k8s.pod.name", name.clone())
                .set("k8s.namespace", namespace.clone())
                .set("k8s.cluster-name", config.cluster_name.clone())
                .labels("k8s.label.", pod.labels(), &config.label_filter)
                .container_ids([pod]);
            if let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
                attrs.set("k8s.node.name", node);
            }
            owner_attributes(&mut attrs, snapshot, &pod.metadata);

            Target {
                id: namespaced_id(config, &namespace, &name),
                target_type: TargetKind::Pod.target_type(),
                label: name,
                attributes: attrs.build(),
            }
        })
        .collect()
}

pub(super) fn nodes(snapshot: &Snapshot, config: &Config) -> Vec<Target> {
    snapshot
        .list::<Node>()
        .iter()
        .filter(|node| !is_excluded(&node.metadata, config))
        .map(|node| {
            let name = node.name_any();
            let pods = snapshot.pods_on_node(&name);
            let mut attrs = Attributes::new();
            attrs
                .set("host.hostname", name.clone())
                .set("k8s.node.name", name.clone())
                .set("k8s.cluster-name", config.cluster_name.clone())
                .set("k8s.distribution", config.distribution.clone())
                .labels("k8s.label.", node.labels(), &config.label_filter)
                .set_all("k8s.pod.name", pods.iter().map(|p| p.name_any()).collect());

            Target {
                id: format!("{}/{}", config.cluster_name, name),
                target_type: TargetKind::Node.target_type(),
                label: name,
                attributes: attrs.build(),
            }
        })
        .collect()
}

/// Shared shape of deployment, daemonset and statefulset targets
fn workload(
    snapshot: &Snapshot,
    config: &Config,
    kind: TargetKind,
    meta: &ObjectMeta,
    selector: Option<&LabelSelector>,
) -> (Attributes, Target) {
    let name = meta.name.clone().unwrap_or_default();
    let namespace = meta.namespace.clone().unwrap_or_default();
    let labels = meta.labels.clone().unwrap_or_default();
    let pods = snapshot.pods_by_selector(selector, &namespace);

    let mut attrs = Attributes::new();
    attrs
        .set("k8s.namespace", namespace.clone())
        .set(format!("k8s.{kind}"), name.clone())
        .set("k8s.cluster-name", config.cluster_name.clone())
        .set("k8s.distribution", config.distribution.clone())
        .labels("k8s.label.", &labels, &config.label_filter)
        .labels(&format!("k8s.{kind}.label."), &labels, &config.label_filter)
        .workload_pods(&pods);

    let target = Target {
        id: namespaced_id(config, &namespace, &name),
        target_type: kind.target_type(),
        label: name,
        attributes: Default::default(),
    };
    (attrs, target)
}

pub(super) fn deployments(snapshot: &Snapshot, config: &Config) -> Vec<Target> {
    snapshot
        .list::<Deployment>()
        .iter()
        .filter(|d| !is_excluded(&d.metadata, config))
        .map(|d| {
            let spec = d.spec.as_ref();
            let (mut attrs, mut target) = workload(
                snapshot,
                config,
                TargetKind::Deployment,
                &d.metadata,
                spec.map(|s| &s.selector),
            );
            let strategy = spec
                .and_then(|s| s.strategy.as_ref())
                .and_then(|s| s.type_.clone())
                .unwrap_or_else(|| "RollingUpdate".to_string());
            let replicas = spec.and_then(|s| s.replicas).unwrap_or(1);
            attrs
                .set("k8s.deployment.strategy", strategy)
                .set("k8s.replicas", replicas.to_string());
            target.attributes = attrs.build();
            target
        })
        .collect()
}

pub(super) fn daemon_sets(snapshot: &Snapshot, config: &Config) -> Vec<Target> {
    snapshot
        .list::<DaemonSet>()
        .iter()
        .filter(|ds| !is_excluded(&ds.metadata, config))
        .map(|ds| {
            let (attrs, mut target) = workload(
                snapshot,
                config,
                TargetKind::DaemonSet,
                &ds.metadata,
                ds.spec.as_ref().map(|s| &s.selector),
            );
            target.attributes = attrs.build();
            target
        })
        .collect()
}

pub(super) fn stateful_sets(snapshot: &Snapshot, config: &Config) -> Vec<Target> {
    snapshot
        .list::<StatefulSet>()
        .iter()
        .filter(|sts| !is_excluded(&sts.metadata, config))
        .map(|sts| {
            let spec = sts.spec.as_ref();
            let (mut attrs, mut target) = workload(
                snapshot,
                config,
                TargetKind::StatefulSet,
                &sts.metadata,
                spec.map(|s| &s.selector),
            );
            attrs.set(
                "k8s.replicas",
                spec.and_then(|s| s.replicas).unwrap_or(1).to_string(),
            );
            target.attributes = attrs.build();
            target
        })
        .collect()
}

/// One record per container with a runtime id, carrying its pod's context
pub(super) fn containers(snapshot: &Snapshot, config: &Config) -> Vec<Target> {
    let mut records = Vec::new();
    for pod in snapshot.list::<Pod>() {
        if is_excluded(&pod.metadata, config) {
            continue;
        }
        let pod_name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_default();
        let node = pod.spec.as_ref().and_then(|s| s.node_name.clone());

        for status in container_statuses(pod) {
            let Some(container_id) = status.container_id.as_deref() else {
                continue;
            };
            let stripped = strip_container_id(container_id).to_string();
            // Prefer the image as written in the pod spec over the resolved one
            let image = pod
                .spec
                .as_ref()
                .and_then(|s| s.containers.iter().find(|c| c.name == status.name))
                .and_then(|c| c.image.clone())
                .unwrap_or_else(|| status.image.clone());

            let mut attrs = Attributes::new();
            attrs
                .set("k8s.container.id", container_id)
                .set("k8s.container.id.stripped", stripped.clone())
                .set("k8s.container.name", status.name.clone())
                .set("k8s.container.image", image)
                .set("k8s.container.ready", status.ready.to_string())
                .set("k8s.pod.name", pod_name.clone())
                .set("k8s.namespace", namespace.clone())
                .set("k8s.cluster-name", config.cluster_name.clone())
                .set("k8s.distribution", config.distribution.clone())
                .labels("k8s.label.", pod.labels(), &config.label_filter)
                .labels("k8s.pod.label.", pod.labels(), &config.label_filter);
            if let Some(node) = &node {
                attrs.set("k8s.node.name", node.clone());
            }
            owner_attributes(&mut attrs, snapshot, &pod.metadata);

            records.push(Target {
                id: stripped,
                target_type: TargetKind::Container.target_type(),
                label: status.name.clone(),
                attributes: attrs.build(),
            });
        }
    }
    records
}

pub(super) fn cluster(config: &Config) -> Vec<Target> {
    let mut attrs = Attributes::new();
    attrs
        .set("k8s.cluster-name", config.cluster_name.clone())
        .set("k8s.distribution", config.distribution.clone());
    vec![Target {
        id: config.cluster_name.clone(),
        target_type: TargetKind::Cluster.target_type(),
        label: config.cluster_name.clone(),
        attributes: attrs.build(),
    }]
}
