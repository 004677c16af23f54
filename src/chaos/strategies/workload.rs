//! Scaling, rollout restart and rollout convergence

use k8s_openapi::api::apps::v1::Deployment;
use tracing::{debug, info};

use super::{namespaced, Progress, StrategyContext};
use crate::chaos::types::{ActionConfig, Disruption, TargetRef};
use crate::error::ActionError;
use crate::k8s::WorkloadKind;
use crate::retry::retry_transient;

/// Condition reason the deployment controller sets when a rollout stalls
const PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";

fn name_key(workload: WorkloadKind) -> &'static str {
    match workload {
        WorkloadKind::Deployment => "k8s.deployment",
        WorkloadKind::StatefulSet => "k8s.statefulset",
    }
}

pub(super) async fn prepare_scale(
    workload: WorkloadKind,
    target: &TargetRef,
    config: &ActionConfig,
    ctx: &StrategyContext<'_>,
) -> Result<Disruption, ActionError> {
    let (namespace, name) = namespaced(target, name_key(workload))?;
    let replicas = config
        .replica_count
        .ok_or_else(|| ActionError::validation("replicaCount is required"))?;
    let replicas = i32::try_from(replicas)
        .ok()
        .filter(|r| *r >= 0)
        .ok_or_else(|| ActionError::validation("replicaCount must be between 0 and 2147483647"))?;

    // Read the live object, not the cache, so revert restores the real value
    let original_replicas = match workload {
        WorkloadKind::Deployment => ctx
            .api
            .get_deployment(&namespace, &name)
            .await?
            .spec
            .and_then(|s| s.replicas),
        WorkloadKind::StatefulSet => ctx
            .api
            .get_stateful_set(&namespace, &name)
            .await?
            .spec
            .and_then(|s| s.replicas),
    }
    .unwrap_or(1);

    Ok(Disruption::Scale {
        workload,
        namespace,
        name,
        replicas,
        original_replicas,
    })
}

pub(super) async fn prepare_restart(
    target: &TargetRef,
    config: &ActionConfig,
    ctx: &StrategyContext<'_>,
) -> Result<Disruption, ActionError> {
    let (namespace, name) = namespaced(target, "k8s.deployment")?;
    ctx.api.get_deployment(&namespace, &name).await?;
    Ok(Disruption::RolloutRestart {
        namespace,
        name,
        wait: config.wait.unwrap_or(false),
    })
}

pub(super) fn prepare_status(target: &TargetRef) -> Result<Disruption, ActionError> {
    let (namespace, name) = namespaced(target, "k8s.deployment")?;
    Ok(Disruption::RolloutStatus { namespace, name })
}

pub(super) async fn scale(
    ctx: &StrategyContext<'_>,
    workload: WorkloadKind,
    namespace: &str,
    name: &str,
    replicas: i32,
) -> Result<(), ActionError> {
    retry_transient(&ctx.retry, "scale_workload", || {
        ctx.api.scale_workload(workload, namespace, name, replicas)
    })
    .await?;
    info!(kind = %workload, namespace = %namespace, name = %name, replicas, "Workload scaled");
    Ok(())
}

pub(super) async fn restart(
    ctx: &StrategyContext<'_>,
    namespace: &str,
    name: &str,
) -> Result<(), ActionError> {
    retry_transient(&ctx.retry, "restart_deployment", || {
        ctx.api.restart_deployment(namespace, name)
    })
    .await?;
    Ok(())
}

pub(super) async fn rollout_progress(
    ctx: &StrategyContext<'_>,
    namespace: &str,
    name: &str,
) -> Result<Progress, ActionError> {
    let deployment = retry_transient(&ctx.retry, "get_deployment", || {
        ctx.api.get_deployment(namespace, name)
    })
    .await?;
    let progress = evaluate_rollout(&deployment);
    debug!(namespace = %namespace, name = %name, ?progress, "Rollout polled");
    Ok(progress)
}

/// Rollout completion the way `kubectl rollout status` decides it
pub fn evaluate_rollout(deployment: &Deployment) -> Progress {
    let generation = deployment.metadata.generation.unwrap_or(0);
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return Progress::Running;
    };

    if status.observed_generation.unwrap_or(0) < generation {
        return Progress::Running;
    }

    let stalled = status
        .conditions
        .as_ref()
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "Progressing" && c.reason.as_deref() == Some(PROGRESS_DEADLINE_EXCEEDED));
    if stalled {
        return Progress::Failed(format!(
            "deployment {} exceeded its progress deadline",
            deployment.metadata.name.as_deref().unwrap_or_default()
        ));
    }

    let updated = status.updated_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    if updated == desired && total == desired && available == desired {
        Progress::Converged
    } else {
        Progress::Running
    }
}
