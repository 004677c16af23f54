//! Target discovery
//!
//! Projects a cache [`Snapshot`] into attributed targets per kind and
//! correlates target sets through static enrichment rules. Everything here
//! is pure: the same snapshot always yields the same output.

mod attributes;
mod enrichment;
mod exclusion;
mod targets;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::k8s::Snapshot;

pub use attributes::{apply_attribute_excludes, strip_container_id, Attributes};
pub use enrichment::{enrichment_rules, evaluate_rule, EnrichmentRecord, EnrichmentRule};
pub use exclusion::{is_excluded, DISCOVERY_DISABLED_KEY};

/// Prefix of every target type id
pub const TARGET_TYPE_PREFIX: &str = "kubefault";

/// Kinds of targets discovery produces
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TargetKind {
    Pod,
    Node,
    Deployment,
    DaemonSet,
    StatefulSet,
    /// Enrichment data, one record per running container
    Container,
    Cluster,
}

impl TargetKind {
    /// Type id reported on every target of this kind, e.g. `kubefault.kubernetes-pod`
    pub fn target_type(&self) -> String {
        format!("{}.kubernetes-{}", TARGET_TYPE_PREFIX, self)
    }
}

/// A discovered, attributed cluster resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: String,
    pub target_type: String,
    pub label: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl Target {
    /// First value of an attribute
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

/// Discovery over cache snapshots, configured once at startup
#[derive(Clone)]
pub struct DiscoveryEngine {
    config: Arc<Config>,
}

impl DiscoveryEngine {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Discover every target of `kind` in the snapshot, excludes applied
    pub fn discover(&self, snapshot: &Snapshot, kind: TargetKind) -> Vec<Target> {
        let config = self.config.as_ref();
        let mut found = match kind {
            TargetKind::Pod => targets::pods(snapshot, config),
            TargetKind::Node => targets::nodes(snapshot, config),
            TargetKind::Deployment => targets::deployments(snapshot, config),
            TargetKind::DaemonSet => targets::daemon_sets(snapshot, config),
            TargetKind::StatefulSet => targets::stateful_sets(snapshot, config),
            TargetKind::Container => targets::containers(snapshot, config),
            TargetKind::Cluster => targets::cluster(config),
        };

        let excludes = config.attribute_excludes(kind);
        for target in &mut found {
            apply_attribute_excludes(&mut target.attributes, excludes);
        }
        found
    }

    pub fn enrichment_rules(&self) -> Vec<EnrichmentRule> {
        enrichment_rules()
    }

    /// Evaluate one enrichment rule against fresh discovery of both sides.
    /// Returns `None` for an unknown rule id.
    pub fn enrich(&self, snapshot: &Snapshot, rule_id: &str) -> Option<Vec<EnrichmentRecord>> {
        let rule = enrichment_rules().into_iter().find(|r| r.id == rule_id)?;
        let sources = self.discover(snapshot, rule.source);
        let destinations = self.discover(snapshot, rule.destination);
        Some(evaluate_rule(
            &rule,
            &sources,
            &destinations,
            self.config.attribute_excludes(rule.destination),
        ))
    }
}
