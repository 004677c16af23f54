use k8s_openapi::api::core::v1::Pod;
use tracing::info;

use super::{namespaced, StrategyContext};
use crate::chaos::types::{ActionConfig, Disruption, TargetRef};
use crate::error::ActionError;
use crate::retry::retry_transient;

pub(super) async fn prepare_delete(
    target: &TargetRef,
    config: &ActionConfig,
    ctx: &StrategyContext<'_>,
) -> Result<Disruption, ActionError> {
    let (namespace, name) = namespaced(target, "k8s.pod.name")?;
    let grace_period_seconds = match config.grace_period {
        Some(secs) => Some(u32::try_from(secs).map_err(|_| {
            ActionError::validation("gracePeriod must be zero or a positive number of seconds")
        })?),
        None => None,
    };
    // Informational only; a pod missing from the cache is still deleted
    let node = ctx
        .cache
        .get::<Pod>(&namespace, &name)
        .await
        .and_then(|p| p.spec.and_then(|s| s.node_name));

    Ok(Disruption::DeletePod {
        namespace,
        name,
        grace_period_seconds,
        node,
    })
}

/// Delete the pod. A pod that is already gone is the desired end state.
pub(super) async fn delete(
    ctx: &StrategyContext<'_>,
    namespace: &str,
    name: &str,
    grace_period_seconds: Option<u32>,
) -> Result<(), ActionError> {
    let result = retry_transient(&ctx.retry, "delete_pod", || {
        ctx.api.delete_pod(namespace, name, grace_period_seconds)
    })
    .await;

    match result {
        Ok(()) => {
            info!(namespace = %namespace, pod = %name, "Pod deleted");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            info!(namespace = %namespace, pod = %name, "Pod already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
