//! Per-disruption forward, completion and undo steps
//!
//! [`Disruption`] is the closed set of strategies. The engine only calls
//! [`prepare`], [`Disruption::apply`], [`Disruption::poll`] and
//! [`Disruption::revert`] and never needs to know the Kubernetes verbs.

mod node;
mod pod;
mod workload;

use std::time::Duration;

use crate::chaos::types::{ActionConfig, ActionKind, Disruption, PrepareRequest, TargetRef};
use crate::config::Config;
use crate::error::ActionError;
use crate::k8s::{ClusterApi, SnapshotCache, WorkloadKind};
use crate::retry::RetryConfig;

/// Everything a strategy may touch
pub struct StrategyContext<'a> {
    pub api: &'a dyn ClusterApi,
    pub cache: &'a SnapshotCache,
    pub config: &'a Config,
    pub retry: RetryConfig,
}

impl<'a> StrategyContext<'a> {
    pub fn new(api: &'a dyn ClusterApi, cache: &'a SnapshotCache, config: &'a Config) -> Self {
        Self {
            api,
            cache,
            config,
            retry: RetryConfig::with_max_attempts(config.cluster_retry_attempts),
        }
    }
}

/// Result of polling a convergence-bound disruption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Running,
    Converged,
    Failed(String),
}

/// A prepared disruption plus how long it is held or allowed to converge
#[derive(Debug)]
pub struct Prepared {
    pub disruption: Disruption,
    pub duration: Option<Duration>,
}

/// Validate the request and capture what revert will need
pub async fn prepare(
    kind: ActionKind,
    request: &PrepareRequest,
    ctx: &StrategyContext<'_>,
) -> Result<Prepared, ActionError> {
    check_cluster(&request.target, ctx.config)?;
    let config = &request.config;

    let duration = duration_for(kind, config, ctx.config)?;
    let disruption = match kind {
        ActionKind::TaintNode => node::prepare_taint(&request.target, config, ctx).await?,
        ActionKind::DrainNode => node::prepare_drain(&request.target, ctx).await?,
        ActionKind::DeletePod => pod::prepare_delete(&request.target, config, ctx).await?,
        ActionKind::ScaleDeployment => {
            workload::prepare_scale(WorkloadKind::Deployment, &request.target, config, ctx).await?
        }
        ActionKind::ScaleStatefulSet => {
            workload::prepare_scale(WorkloadKind::StatefulSet, &request.target, config, ctx).await?
        }
        ActionKind::RolloutRestart => {
            workload::prepare_restart(&request.target, config, ctx).await?
        }
        ActionKind::RolloutStatus => workload::prepare_status(&request.target)?,
    };

    Ok(Prepared {
        disruption,
        duration,
    })
}

/// Reject targets discovered in a different cluster
fn check_cluster(target: &TargetRef, config: &Config) -> Result<(), ActionError> {
    match target.attribute("k8s.cluster-name") {
        Some(name) if name != config.cluster_name => Err(ActionError::validation(format!(
            "target belongs to cluster {name}, this instance serves {}",
            config.cluster_name
        ))),
        _ => Ok(()),
    }
}

fn duration_for(
    kind: ActionKind,
    config: &ActionConfig,
    settings: &Config,
) -> Result<Option<Duration>, ActionError> {
    let given = config.duration.map(Duration::from_millis);
    match kind {
        _ if kind.is_duration_bound() => match given {
            Some(d) if !d.is_zero() => Ok(Some(d)),
            _ => Err(ActionError::validation("duration must be a positive number of milliseconds")),
        },
        ActionKind::RolloutStatus => Ok(Some(
            given
                .filter(|d| !d.is_zero())
                .unwrap_or_else(|| settings.rollout_default_deadline()),
        )),
        ActionKind::RolloutRestart if config.wait.unwrap_or(false) => Ok(Some(
            given
                .filter(|d| !d.is_zero())
                .unwrap_or_else(|| settings.rollout_default_deadline()),
        )),
        _ => Ok(None),
    }
}

/// Namespaced workload identity from target attributes
fn namespaced(target: &TargetRef, name_key: &str) -> Result<(String, String), ActionError> {
    let namespace = target.require("k8s.namespace")?.to_string();
    let name = target.require(name_key)?.to_string();
    Ok((namespace, name))
}

impl Disruption {
    /// Issue the forward mutation. May record what it actually changed.
    pub async fn apply(&mut self, ctx: &StrategyContext<'_>) -> Result<(), ActionError> {
        match self {
            Disruption::TaintNode { node, taint, added } => {
                *added = node::add_taint(ctx, node, taint).await?;
            }
            Disruption::DrainNode {
                node,
                was_unschedulable,
                cordoned_by_us,
                evicted,
            } => {
                if !*was_unschedulable {
                    node::cordon(ctx, node).await?;
                    *cordoned_by_us = true;
                }
                *evicted = node::evict_all(ctx, node).await?;
            }
            Disruption::DeletePod {
                namespace,
                name,
                grace_period_seconds,
                ..
            } => pod::delete(ctx, namespace, name, *grace_period_seconds).await?,
            Disruption::Scale {
                workload,
                namespace,
                name,
                replicas,
                ..
            } => workload::scale(ctx, *workload, namespace, name, *replicas).await?,
            Disruption::RolloutRestart {
                namespace, name, ..
            } => workload::restart(ctx, namespace, name).await?,
            Disruption::RolloutStatus { .. } => {}
        }
        Ok(())
    }

    /// Whether a convergence condition has been reached. Disruptions without
    /// one report [`Progress::Converged`] right away.
    pub async fn poll(&self, ctx: &StrategyContext<'_>) -> Result<Progress, ActionError> {
        match self {
            Disruption::RolloutStatus { namespace, name }
            | Disruption::RolloutRestart {
                namespace,
                name,
                wait: true,
            } => workload::rollout_progress(ctx, namespace, name).await,
            _ => Ok(Progress::Converged),
        }
    }

    /// The record to persist before [`apply`](Self::apply) runs: it assumes
    /// every forward step succeeds, so recovery after a crash mid-apply
    /// still undoes whatever did land.
    pub fn intended(&self) -> Disruption {
        let mut planned = self.clone();
        if let Disruption::DrainNode {
            was_unschedulable,
            cordoned_by_us,
            ..
        } = &mut planned
        {
            *cordoned_by_us = !*was_unschedulable;
        }
        planned
    }

    /// Whether [`poll`](Self::poll) decides completion instead of the held duration
    pub fn is_convergence_bound(&self) -> bool {
        matches!(
            self,
            Disruption::RolloutStatus { .. } | Disruption::RolloutRestart { wait: true, .. }
        )
    }

    /// Undo the forward mutation. A vanished resource counts as undone.
    pub async fn revert(&self, ctx: &StrategyContext<'_>) -> Result<(), ActionError> {
        let result = match self {
            Disruption::TaintNode {
                node,
                taint,
                added: true,
            } => node::remove_taint(ctx, node, taint).await,
            Disruption::DrainNode {
                node,
                cordoned_by_us: true,
                ..
            } => node::uncordon(ctx, node).await,
            Disruption::Scale {
                workload,
                namespace,
                name,
                original_replicas,
                ..
            } => workload::scale(ctx, *workload, namespace, name, *original_replicas).await,
            _ => Ok(()),
        };

        match result {
            Err(ActionError::Cluster(e)) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}
