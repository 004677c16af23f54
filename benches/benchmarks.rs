//! Performance benchmarks for kubefault discovery
//!
//! Run with: cargo bench

use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, ReplicaSet};
use k8s_openapi::api::core::v1::{ContainerStatus, Node, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};

use kubefault::config::Config;
use kubefault::discovery::{DiscoveryEngine, TargetKind};
use kubefault::k8s::Snapshot;

const PODS_PER_DEPLOYMENT: usize = 10;

fn labels(app: &str) -> Option<BTreeMap<String, String>> {
    Some([("app".to_string(), app.to_string())].into())
}

fn controller(kind: &str, name: &str) -> Option<Vec<OwnerReference>> {
    Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: name.to_string(),
        controller: Some(true),
        ..Default::default()
    }])
}

/// `pods` pods spread over deployments of ten replicas and 50 nodes
fn cluster(pods: usize) -> Snapshot {
    let deployments = pods.div_ceil(PODS_PER_DEPLOYMENT);

    let nodes: Vec<Node> = (0..50)
        .map(|i| Node {
            metadata: ObjectMeta {
                name: Some(format!("node-{i}")),
                ..Default::default()
            },
            ..Default::default()
        })
        .collect();

    let mut deploys = Vec::with_capacity(deployments);
    let mut replica_sets = Vec::with_capacity(deployments);
    for d in 0..deployments {
        let app = format!("app-{d}");
        deploys.push(Deployment {
            metadata: ObjectMeta {
                name: Some(app.clone()),
                namespace: Some("bench".to_string()),
                labels: labels(&app),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(PODS_PER_DEPLOYMENT as i32),
                selector: LabelSelector {
                    match_labels: labels(&app),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        });
        replica_sets.push(ReplicaSet {
            metadata: ObjectMeta {
                name: Some(format!("{app}-rs")),
                namespace: Some("bench".to_string()),
                owner_references: controller("Deployment", &app),
                ..Default::default()
            },
            ..Default::default()
        });
    }

    let pod_list: Vec<Pod> = (0..pods)
        .map(|i| {
            let app = format!("app-{}", i / PODS_PER_DEPLOYMENT);
            Pod {
                metadata: ObjectMeta {
                    name: Some(format!("{app}-pod-{i}")),
                    namespace: Some("bench".to_string()),
                    labels: labels(&app),
                    owner_references: controller("ReplicaSet", &format!("{app}-rs")),
                    ..Default::default()
                },
                spec: Some(PodSpec {
                    node_name: Some(format!("node-{}", i % 50)),
                    ..Default::default()
                }),
                status: Some(PodStatus {
                    container_statuses: Some(vec![ContainerStatus {
                        name: "main".to_string(),
                        container_id: Some(format!("containerd://{i:064x}")),
                        ready: true,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            }
        })
        .collect();

    Snapshot::default()
        .with(nodes)
        .with(deploys)
        .with(replica_sets)
        .with(pod_list)
}

fn bench_discovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("discovery");
    let engine = DiscoveryEngine::new(Arc::new(Config::default()));

    for size in [100, 1_000, 5_000] {
        let snapshot = cluster(size);
        group.throughput(Throughput::Elements(size as u64));

        for kind in [TargetKind::Pod, TargetKind::Deployment, TargetKind::Node] {
            group.bench_with_input(BenchmarkId::new(kind.to_string(), size), &snapshot, |b, s| {
                b.iter(|| black_box(engine.discover(s, kind)));
            });
        }
    }

    group.finish();
}

fn bench_enrichment(c: &mut Criterion) {
    let mut group = c.benchmark_group("enrichment");
    let engine = DiscoveryEngine::new(Arc::new(Config::default()));
    let rule = "kubefault.kubernetes-deployment-to-container";

    for size in [100, 1_000, 5_000] {
        let snapshot = cluster(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("deployment", size), &snapshot, |b, s| {
            b.iter(|| black_box(engine.enrich(s, rule)));
        });
    }

    group.finish();
}

/// Serializing a discovery response, as the API does
fn bench_target_serialization(c: &mut Criterion) {
    let engine = DiscoveryEngine::new(Arc::new(Config::default()));
    let targets = engine.discover(&cluster(1_000), TargetKind::Container);

    c.bench_function("serialize_1000_containers", |b| {
        b.iter(|| serde_json::to_vec(black_box(&targets)).unwrap());
    });
}

criterion_group!(
    benches,
    bench_discovery,
    bench_enrichment,
    bench_target_serialization,
);
criterion_main!(benches);
