use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

use crate::discovery::TargetKind;

/// Process-wide configuration, read once at startup and shared as `Arc<Config>`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Reported as `k8s.cluster-name` on every target
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    #[serde(default = "default_distribution")]
    pub distribution: String,

    /// Label keys never emitted as `k8s.label.*` attributes
    #[serde(default = "default_label_filter")]
    pub label_filter: Vec<String>,

    #[serde(default)]
    pub disable_discovery_excludes: bool,

    #[serde(default)]
    pub excluded_namespaces: Vec<String>,

    #[serde(default)]
    pub discovery_attributes_excludes_pod: Vec<String>,
    #[serde(default)]
    pub discovery_attributes_excludes_node: Vec<String>,
    #[serde(default)]
    pub discovery_attributes_excludes_deployment: Vec<String>,
    #[serde(default)]
    pub discovery_attributes_excludes_daemonset: Vec<String>,
    #[serde(default)]
    pub discovery_attributes_excludes_statefulset: Vec<String>,
    #[serde(default)]
    pub discovery_attributes_excludes_container: Vec<String>,
    #[serde(default)]
    pub discovery_attributes_excludes_cluster: Vec<String>,

    #[serde(default = "default_cache_refresh_interval_secs")]
    pub cache_refresh_interval_secs: u64,

    #[serde(default = "default_action_poll_interval_ms")]
    pub action_poll_interval_ms: u64,

    /// Attempts for transient cluster failures during start, status and revert
    #[serde(default = "default_cluster_retry_attempts")]
    pub cluster_retry_attempts: u32,

    /// Eviction rounds before a drain gives up on the remaining pods
    #[serde(default = "default_drain_max_attempts")]
    pub drain_max_attempts: u32,

    #[serde(default = "default_rollout_default_deadline_secs")]
    pub rollout_default_deadline_secs: u64,

    /// How long finished actions stay visible before they are swept
    #[serde(default = "default_action_retention_secs")]
    pub action_retention_secs: u64,
}

const LIST_KEYS: &[&str] = &[
    "label_filter",
    "excluded_namespaces",
    "discovery_attributes_excludes_pod",
    "discovery_attributes_excludes_node",
    "discovery_attributes_excludes_deployment",
    "discovery_attributes_excludes_daemonset",
    "discovery_attributes_excludes_statefulset",
    "discovery_attributes_excludes_container",
    "discovery_attributes_excludes_cluster",
];

fn default_port() -> u16 {
    8088
}

fn default_database_url() -> String {
    "sqlite://kubefault.db".to_string()
}

fn default_cluster_name() -> String {
    "unknown".to_string()
}

fn default_distribution() -> String {
    "kubernetes".to_string()
}

fn default_label_filter() -> Vec<String> {
    vec![
        "controller-revision-hash".to_string(),
        "pod-template-generation".to_string(),
        "pod-template-hash".to_string(),
    ]
}

fn default_cache_refresh_interval_secs() -> u64 {
    30
}

fn default_action_poll_interval_ms() -> u64 {
    1000
}

fn default_cluster_retry_attempts() -> u32 {
    5
}

fn default_drain_max_attempts() -> u32 {
    5
}

fn default_rollout_default_deadline_secs() -> u64 {
    600
}

fn default_action_retention_secs() -> u64 {
    3600
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let mut env = config::Environment::default()
            .try_parsing(true)
            .list_separator(",");
        for key in LIST_KEYS {
            env = env.with_list_parse_key(key);
        }

        let settings: Config = config::Config::builder()
            .add_source(env)
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }

    // Both intervals feed tokio::time::interval, which rejects zero
    pub fn cache_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache_refresh_interval_secs.max(1))
    }

    pub fn action_poll_interval(&self) -> Duration {
        Duration::from_millis(self.action_poll_interval_ms.max(1))
    }

    pub fn action_retention(&self) -> Duration {
        Duration::from_secs(self.action_retention_secs)
    }

    /// Sweeps run ten times per retention period, at most once a minute
    pub fn action_sweep_interval(&self) -> Duration {
        Duration::from_secs((self.action_retention_secs / 10).clamp(1, 60))
    }

    pub fn rollout_default_deadline(&self) -> Duration {
        Duration::from_secs(self.rollout_default_deadline_secs)
    }

    /// Attribute exclude patterns configured for one target kind
    pub fn attribute_excludes(&self, kind: TargetKind) -> &[String] {
        match kind {
            TargetKind::Pod => &self.discovery_attributes_excludes_pod,
            TargetKind::Node => &self.discovery_attributes_excludes_node,
            TargetKind::Deployment => &self.discovery_attributes_excludes_deployment,
            TargetKind::DaemonSet => &self.discovery_attributes_excludes_daemonset,
            TargetKind::StatefulSet => &self.discovery_attributes_excludes_statefulset,
            TargetKind::Container => &self.discovery_attributes_excludes_container,
            TargetKind::Cluster => &self.discovery_attributes_excludes_cluster,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            database_url: default_database_url(),
            cluster_name: default_cluster_name(),
            distribution: default_distribution(),
            label_filter: default_label_filter(),
            disable_discovery_excludes: false,
            excluded_namespaces: Vec::new(),
            discovery_attributes_excludes_pod: Vec::new(),
            discovery_attributes_excludes_node: Vec::new(),
            discovery_attributes_excludes_deployment: Vec::new(),
            discovery_attributes_excludes_daemonset: Vec::new(),
            discovery_attributes_excludes_statefulset: Vec::new(),
            discovery_attributes_excludes_container: Vec::new(),
            discovery_attributes_excludes_cluster: Vec::new(),
            cache_refresh_interval_secs: default_cache_refresh_interval_secs(),
            action_poll_interval_ms: default_action_poll_interval_ms(),
            cluster_retry_attempts: default_cluster_retry_attempts(),
            drain_max_attempts: default_drain_max_attempts(),
            rollout_default_deadline_secs: default_rollout_default_deadline_secs(),
            action_retention_secs: default_action_retention_secs(),
        }
    }
}
