//! Node taint and cordon+drain

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use tracing::{info, warn};

use super::StrategyContext;
use crate::chaos::types::{ActionConfig, Disruption, TaintSpec, TargetRef};
use crate::error::{ActionError, ClusterError};
use crate::retry::retry_transient;

/// Annotation the kubelet sets on static (mirror) pods
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Node name from `host.hostname`, falling back to `k8s.node.name`
fn node_name(target: &TargetRef) -> Result<String, ActionError> {
    target
        .attribute("host.hostname")
        .or_else(|| target.attribute("k8s.node.name"))
        .map(str::to_string)
        .ok_or_else(|| ActionError::validation("target is missing attribute host.hostname"))
}

/// Make sure the node is known, re-listing nodes once on a cache miss
async fn ensure_node(ctx: &StrategyContext<'_>, name: &str) -> Result<(), ActionError> {
    if ctx.cache.get::<Node>("", name).await.is_some() {
        return Ok(());
    }
    ctx.cache.refresh_kind::<Node>(ctx.api).await?;
    match ctx.cache.get::<Node>("", name).await {
        Some(_) => Ok(()),
        None => Err(ClusterError::not_found("Node", name).into()),
    }
}

pub(super) async fn prepare_taint(
    target: &TargetRef,
    config: &ActionConfig,
    ctx: &StrategyContext<'_>,
) -> Result<Disruption, ActionError> {
    let node = node_name(target)?;
    let key = config
        .key
        .clone()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ActionError::validation("taint key is required"))?;
    let effect = config.effect.as_deref().unwrap_or("NoSchedule").parse()?;
    let taint = TaintSpec {
        key,
        value: config.value.clone().filter(|v| !v.is_empty()),
        effect,
    };

    ensure_node(ctx, &node).await?;
    let current = ctx.api.get_node(&node).await?;
    let present = node_taints(&current).iter().any(|t| taint.matches(t));

    Ok(Disruption::TaintNode {
        node,
        taint,
        added: !present,
    })
}

pub(super) async fn prepare_drain(
    target: &TargetRef,
    ctx: &StrategyContext<'_>,
) -> Result<Disruption, ActionError> {
    let node = node_name(target)?;
    ensure_node(ctx, &node).await?;
    let current = ctx.api.get_node(&node).await?;

    Ok(Disruption::DrainNode {
        node,
        was_unschedulable: is_unschedulable(&current),
        cordoned_by_us: false,
        evicted: Vec::new(),
    })
}

fn node_taints(node: &Node) -> Vec<k8s_openapi::api::core::v1::Taint> {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default()
}

fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// Add the taint unless an equal (key, effect) taint exists. Returns
/// whether this call added it.
pub(super) async fn add_taint(
    ctx: &StrategyContext<'_>,
    node: &str,
    taint: &TaintSpec,
) -> Result<bool, ActionError> {
    let added = retry_transient(&ctx.retry, "add_taint", || async {
        let current = ctx.api.get_node(node).await?;
        let mut taints = node_taints(&current);
        if taints.iter().any(|t| taint.matches(t)) {
            return Ok(false);
        }
        taints.push(taint.to_taint());
        ctx.api
            .set_node_taints(node, current.resource_version(), taints)
            .await?;
        Ok::<_, ClusterError>(true)
    })
    .await?;

    if added {
        info!(node = %node, key = %taint.key, effect = %taint.effect, "Taint added");
    } else {
        warn!(node = %node, key = %taint.key, "Taint already present, leaving node untouched");
    }
    Ok(added)
}

/// Remove exactly the (key, effect) taint, keeping every other taint
pub(super) async fn remove_taint(
    ctx: &StrategyContext<'_>,
    node: &str,
    taint: &TaintSpec,
) -> Result<(), ActionError> {
    retry_transient(&ctx.retry, "remove_taint", || async {
        let current = ctx.api.get_node(node).await?;
        let taints = node_taints(&current);
        let kept: Vec<_> = taints.iter().filter(|t| !taint.matches(t)).cloned().collect();
        if kept.len() == taints.len() {
            return Ok(());
        }
        ctx.api
            .set_node_taints(node, current.resource_version(), kept)
            .await
    })
    .await?;
    info!(node = %node, key = %taint.key, "Taint removed");
    Ok(())
}

pub(super) async fn cordon(ctx: &StrategyContext<'_>, node: &str) -> Result<(), ActionError> {
    retry_transient(&ctx.retry, "cordon", || ctx.api.set_node_unschedulable(node, true)).await?;
    info!(node = %node, "Node cordoned");
    Ok(())
}

pub(super) async fn uncordon(ctx: &StrategyContext<'_>, node: &str) -> Result<(), ActionError> {
    retry_transient(&ctx.retry, "uncordon", || ctx.api.set_node_unschedulable(node, false)).await?;
    info!(node = %node, "Node uncordoned");
    Ok(())
}

/// Pods a drain must move: not DaemonSet-managed, not mirror pods, not
/// finished and not already terminating
fn needs_eviction(pod: &Pod) -> bool {
    let daemon = pod
        .owner_references()
        .iter()
        .any(|o| o.kind == "DaemonSet" && o.controller == Some(true));
    let mirror = pod.annotations().contains_key(MIRROR_POD_ANNOTATION);
    let finished = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Succeeded" || p == "Failed");
    let terminating = pod.metadata.deletion_timestamp.is_some();
    !(daemon || mirror || finished || terminating)
}

/// Evict every evictable pod on the node in bounded rounds. Pods refused
/// with a transient error (disruption budget 429, conflicts, 5xx) are
/// retried next round; anything left after the last round fails the drain.
pub(super) async fn evict_all(
    ctx: &StrategyContext<'_>,
    node: &str,
) -> Result<Vec<String>, ActionError> {
    let rounds = ctx.config.drain_max_attempts.max(1);
    let mut evicted = BTreeSet::new();
    let mut remaining = 0;

    for round in 1..=rounds {
        let pods = retry_transient(&ctx.retry, "list_pods_on_node", || {
            ctx.api.list_pods_on_node(node)
        })
        .await?;

        let pending: Vec<&Pod> = pods
            .iter()
            .filter(|p| needs_eviction(p))
            .filter(|p| !evicted.contains(&pod_key(p)))
            .collect();
        if pending.is_empty() {
            remaining = 0;
            break;
        }

        remaining = 0;
        for pod in pending {
            let namespace = pod.namespace().unwrap_or_default();
            let name = pod.name_any();
            match ctx.api.evict_pod(&namespace, &name).await {
                Ok(()) => {
                    evicted.insert(pod_key(pod));
                }
                Err(e) if e.is_not_found() => {
                    evicted.insert(pod_key(pod));
                }
                Err(e) if e.is_transient() => {
                    warn!(node = %node, pod = %name, round, error = %e, "Eviction refused, will retry");
                    remaining += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if remaining == 0 {
            break;
        }
        if round < rounds {
            tokio::time::sleep(ctx.retry.initial_delay).await;
        }
    }

    if remaining > 0 {
        return Err(ActionError::DrainIncomplete {
            node: node.to_string(),
            remaining,
        });
    }

    info!(node = %node, evicted = evicted.len(), "Node drained");
    Ok(evicted.into_iter().collect())
}

fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::k8s::{MockClusterApi, Snapshot, SnapshotCache};
    use k8s_openapi::api::core::v1::{NodeSpec, Taint};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn node(name: &str, taints: Vec<Taint>, unschedulable: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints: Some(taints),
                unschedulable: Some(unschedulable),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(name: &str, owner_kind: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                owner_references: owner_kind.map(|kind| {
                    vec![OwnerReference {
                        kind: kind.to_string(),
                        name: "owner".to_string(),
                        controller: Some(true),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn target(attrs: &[(&str, &str)]) -> TargetRef {
        TargetRef {
            name: None,
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
                .collect(),
        }
    }

    fn spec() -> TaintSpec {
        TaintSpec {
            key: "allowed".into(),
            value: Some("nothing".into()),
            effect: crate::chaos::types::TaintEffect::NoSchedule,
        }
    }

    #[test]
    fn test_node_name_fallback() {
        assert_eq!(node_name(&target(&[("k8s.node.name", "n1")])).unwrap(), "n1");
        assert_eq!(
            node_name(&target(&[("host.hostname", "h"), ("k8s.node.name", "n")])).unwrap(),
            "h"
        );
        assert!(matches!(node_name(&target(&[])), Err(ActionError::Validation(_))));
    }

    #[test]
    fn test_needs_eviction_skips_daemonsets_and_mirrors() {
        assert!(needs_eviction(&pod("web", Some("ReplicaSet"))));
        assert!(!needs_eviction(&pod("agent", Some("DaemonSet"))));

        let mut mirror = pod("etcd", None);
        mirror.metadata.annotations =
            Some([(MIRROR_POD_ANNOTATION.to_string(), "x".to_string())].into());
        assert!(!needs_eviction(&mirror));
    }

    #[tokio::test]
    async fn test_prepare_taint_captures_presence() {
        let mut api = MockClusterApi::new();
        api.expect_get_node()
            .returning(|_| Ok(node("n1", vec![], false)));
        let cache = SnapshotCache::with_snapshot(
            Snapshot::default().with(vec![node("n1", vec![], false)]),
        );
        let config = Config::default();
        let ctx = StrategyContext::new(&api, &cache, &config);
        let action_config = ActionConfig {
            key: Some("allowed".into()),
            value: Some("nothing".into()),
            effect: Some("NoSchedule".into()),
            ..Default::default()
        };

        let disruption = prepare_taint(&target(&[("host.hostname", "n1")]), &action_config, &ctx)
            .await
            .unwrap();

        assert_eq!(
            disruption,
            Disruption::TaintNode {
                node: "n1".into(),
                taint: spec(),
                added: true
            }
        );
    }

    #[tokio::test]
    async fn test_prepare_taint_rejects_bad_effect() {
        let api = MockClusterApi::new();
        let cache = SnapshotCache::new();
        let config = Config::default();
        let ctx = StrategyContext::new(&api, &cache, &config);
        let action_config = ActionConfig {
            key: Some("k".into()),
            effect: Some("Sometimes".into()),
            ..Default::default()
        };

        let result = prepare_taint(&target(&[("host.hostname", "n1")]), &action_config, &ctx).await;

        assert!(matches!(result, Err(ActionError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_node_is_not_found() {
        let mut api = MockClusterApi::new();
        api.expect_list_nodes().times(1).returning(|| Ok(vec![]));
        let cache = SnapshotCache::new();
        let config = Config::default();
        let ctx = StrategyContext::new(&api, &cache, &config);

        let result = prepare_drain(&target(&[("host.hostname", "ghost")]), &ctx).await;

        assert!(matches!(result, Err(ActionError::Cluster(ClusterError::NotFound { .. }))));
    }

    #[tokio::test]
    async fn test_remove_taint_keeps_foreign_taints() {
        let foreign = Taint {
            key: "dedicated".into(),
            value: Some("gpu".into()),
            effect: "NoSchedule".into(),
            time_added: None,
        };
        let ours = spec().to_taint();
        let current = node("n1", vec![foreign.clone(), ours], false);

        let mut api = MockClusterApi::new();
        api.expect_get_node().returning(move |_| Ok(current.clone()));
        api.expect_set_node_taints()
            .withf(move |name, rv, taints| {
                name == "n1" && rv.as_deref() == Some("7") && taints == &vec![foreign.clone()]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let cache = SnapshotCache::new();
        let config = Config::default();
        let ctx = StrategyContext::new(&api, &cache, &config);

        remove_taint(&ctx, "n1", &spec()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_taint_retries_conflicts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();

        let mut api = MockClusterApi::new();
        api.expect_get_node()
            .returning(|_| Ok(node("n1", vec![], false)));
        api.expect_set_node_taints().returning(move |_, _, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ClusterError::Conflict("node changed".into()))
            } else {
                Ok(())
            }
        });

        let cache = SnapshotCache::new();
        let config = Config::default();
        let ctx = StrategyContext::new(&api, &cache, &config);

        assert!(add_taint(&ctx, "n1", &spec()).await.unwrap());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_fails_when_pods_stay_blocked() {
        let mut api = MockClusterApi::new();
        api.expect_list_pods_on_node().returning(|_| {
            Ok(vec![
                pod("web-1", Some("ReplicaSet")),
                pod("guarded", Some("ReplicaSet")),
                pod("agent", Some("DaemonSet")),
            ])
        });
        api.expect_evict_pod().returning(|_, name| {
            if name == "guarded" {
                Err(ClusterError::Transient("Cannot evict pod as it would violate the pod's disruption budget (429)".into()))
            } else {
                Ok(())
            }
        });

        let cache = SnapshotCache::new();
        let config = Config {
            drain_max_attempts: 3,
            ..Config::default()
        };
        let ctx = StrategyContext::new(&api, &cache, &config);

        let result = evict_all(&ctx, "n1").await;

        assert_eq!(
            result,
            Err(ActionError::DrainIncomplete {
                node: "n1".into(),
                remaining: 1
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_recovers_from_transient_refusal() {
        let refusals = Arc::new(AtomicU32::new(0));
        let seen = refusals.clone();

        let mut api = MockClusterApi::new();
        api.expect_list_pods_on_node()
            .returning(|_| Ok(vec![pod("web-1", Some("ReplicaSet")), pod("web-2", None)]));
        api.expect_evict_pod().returning(move |_, name| {
            if name == "web-2" && seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ClusterError::Transient("too many requests".into()))
            } else {
                Ok(())
            }
        });

        let cache = SnapshotCache::new();
        let config = Config::default();
        let ctx = StrategyContext::new(&api, &cache, &config);

        let evicted = evict_all(&ctx, "n1").await.unwrap();

        assert_eq!(evicted, vec!["default/web-1", "default/web-2"]);
    }
}
