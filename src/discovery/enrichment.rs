//! Static enrichment rules linking workload targets to container records

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use super::attributes::apply_attribute_excludes;
use super::{Target, TargetKind, TARGET_TYPE_PREFIX};

/// Attribute both sides of every rule are matched on
const MATCH_ATTRIBUTE: &str = "k8s.container.id.stripped";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentRule {
    pub id: String,
    pub source: TargetKind,
    pub destination: TargetKind,
    /// Source attribute whose values must equal a destination value
    pub source_attribute: String,
    pub destination_attribute: String,
    /// Attribute name prefixes copied from source to destination
    pub propagate_prefixes: Vec<String>,
}

/// Source attributes attached to one destination target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentRecord {
    pub rule_id: String,
    pub source_id: String,
    pub destination_id: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

fn rule(source: TargetKind, extra_prefix: Option<String>) -> EnrichmentRule {
    let mut propagate_prefixes = vec!["k8s.label.".to_string()];
    propagate_prefixes.extend(extra_prefix);
    EnrichmentRule {
        id: format!(
            "{}.kubernetes-{}-to-{}",
            TARGET_TYPE_PREFIX,
            source,
            TargetKind::Container
        ),
        source,
        destination: TargetKind::Container,
        source_attribute: MATCH_ATTRIBUTE.to_string(),
        destination_attribute: MATCH_ATTRIBUTE.to_string(),
        propagate_prefixes,
    }
}

/// Every rule the engine knows, in a fixed order
pub fn enrichment_rules() -> Vec<EnrichmentRule> {
    vec![
        rule(TargetKind::Pod, None),
        rule(TargetKind::Deployment, Some("k8s.deployment".to_string())),
        rule(TargetKind::DaemonSet, Some("k8s.daemonset".to_string())),
        rule(TargetKind::StatefulSet, Some("k8s.statefulset".to_string())),
    ]
}

/// Correlate `sources` with `destinations` by equal attribute values.
///
/// Output follows destination order, then source order. `excludes` are the
/// destination kind's attribute exclude patterns and apply to propagated
/// attributes as well.
pub fn evaluate_rule(
    rule: &EnrichmentRule,
    sources: &[Target],
    destinations: &[Target],
    excludes: &[String],
) -> Vec<EnrichmentRecord> {
    let mut by_value: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, source) in sources.iter().enumerate() {
        for value in source.attributes.get(&rule.source_attribute).into_iter().flatten() {
            let entry = by_value.entry(value.as_str()).or_default();
            if entry.last() != Some(&i) {
                entry.push(i);
            }
        }
    }

    let mut records = Vec::new();
    for destination in destinations {
        let mut matched: Vec<usize> = destination
            .attributes
            .get(&rule.destination_attribute)
            .into_iter()
            .flatten()
            .filter_map(|value| by_value.get(value.as_str()))
            .flatten()
            .copied()
            .collect();
        matched.sort_unstable();
        matched.dedup();

        for i in matched {
            let source = &sources[i];
            let mut attributes: BTreeMap<String, Vec<String>> = source
                .attributes
                .iter()
                .filter(|(key, _)| rule.propagate_prefixes.iter().any(|p| key.starts_with(p.as_str())))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            apply_attribute_excludes(&mut attributes, excludes);

            records.push(EnrichmentRecord {
                rule_id: rule.id.clone(),
                source_id: source.id.clone(),
                destination_id: destination.id.clone(),
                attributes,
            });
        }
    }
    records
}
