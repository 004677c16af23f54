//! Action request, state and status models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Taint;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ActionError;
use crate::k8s::WorkloadKind;

/// Disruptions the engine can run
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    TaintNode,
    DrainNode,
    DeletePod,
    ScaleDeployment,
    #[serde(rename = "scale_statefulset")]
    #[strum(serialize = "scale_statefulset")]
    ScaleStatefulSet,
    RolloutRestart,
    RolloutStatus,
}

impl ActionKind {
    /// Held for `duration`, then reverted
    pub fn is_duration_bound(&self) -> bool {
        matches!(
            self,
            ActionKind::TaintNode
                | ActionKind::DrainNode
                | ActionKind::ScaleDeployment
                | ActionKind::ScaleStatefulSet
        )
    }
}

/// Action configuration as sent by callers. Fields are interpreted per kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionConfig {
    /// Milliseconds
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub effect: Option<String>,
    #[serde(default)]
    pub replica_count: Option<i64>,
    /// Seconds
    #[serde(default)]
    pub grace_period: Option<i64>,
    /// Wait for the rollout to converge after a restart
    #[serde(default)]
    pub wait: Option<bool>,
}

/// The target an action is prepared against
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetRef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl TargetRef {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str, ActionError> {
        self.attribute(key)
            .ok_or_else(|| ActionError::validation(format!("target is missing attribute {key}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub target: TargetRef,
    #[serde(default)]
    pub config: ActionConfig,
}

/// Lifecycle phase of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionPhase {
    Prepared,
    Started,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ActionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl std::str::FromStr for TaintEffect {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NoSchedule" => Ok(Self::NoSchedule),
            "PreferNoSchedule" => Ok(Self::PreferNoSchedule),
            "NoExecute" => Ok(Self::NoExecute),
            other => Err(ActionError::validation(format!(
                "unsupported taint effect {other}, expected NoSchedule, PreferNoSchedule or NoExecute"
            ))),
        }
    }
}

impl std::fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaintEffect::NoSchedule => write!(f, "NoSchedule"),
            TaintEffect::PreferNoSchedule => write!(f, "PreferNoSchedule"),
            TaintEffect::NoExecute => write!(f, "NoExecute"),
        }
    }
}

/// The taint a taint action adds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintSpec {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    pub effect: TaintEffect,
}

impl TaintSpec {
    /// A node carries at most one taint per (key, effect)
    pub fn matches(&self, taint: &Taint) -> bool {
        taint.key == self.key && taint.effect == self.effect.to_string()
    }

    pub fn to_taint(&self) -> Taint {
        Taint {
            key: self.key.clone(),
            value: self.value.clone(),
            effect: self.effect.to_string(),
            time_added: None,
        }
    }
}

/// What an action changes, with the original values needed to undo it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Disruption {
    TaintNode {
        node: String,
        taint: TaintSpec,
        /// Whether the taint was absent before start and therefore ours to remove
        added: bool,
    },
    DrainNode {
        node: String,
        /// Whether the node was already unschedulable at prepare time
        was_unschedulable: bool,
        cordoned_by_us: bool,
        evicted: Vec<String>,
    },
    DeletePod {
        namespace: String,
        name: String,
        grace_period_seconds: Option<u32>,
        /// Node the pod was scheduled on when prepared
        node: Option<String>,
    },
    Scale {
        workload: WorkloadKind,
        namespace: String,
        name: String,
        replicas: i32,
        original_replicas: i32,
    },
    RolloutRestart {
        namespace: String,
        name: String,
        wait: bool,
    },
    RolloutStatus {
        namespace: String,
        name: String,
    },
}

/// Externally visible snapshot of an action
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStatus {
    pub id: Uuid,
    pub kind: ActionKind,
    pub phase: ActionPhase,
    pub disruption: Disruption,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
    pub remaining_ms: Option<u64>,
    pub reverted: bool,
    pub error: Option<ActionErrorReport>,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionErrorReport {
    pub code: String,
    pub message: String,
}

impl From<&ActionError> for ActionErrorReport {
    fn from(err: &ActionError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
