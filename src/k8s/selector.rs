//! Label selector evaluation against cached objects

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

/// Evaluate a selector the way the API server does: every `matchLabels`
/// entry and every `matchExpressions` requirement must hold. An empty
/// selector matches everything.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .as_ref()
        .map(|wanted| {
            wanted
                .iter()
                .all(|(k, v)| labels.get(k).map(|actual| actual == v).unwrap_or(false))
        })
        .unwrap_or(true);

    labels_match
        && selector
            .match_expressions
            .as_ref()
            .map(|reqs| reqs.iter().all(|req| requirement_matches(req, labels)))
            .unwrap_or(true)
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" => labels
            .get(&req.key)
            .map(|v| values.contains(v))
            .unwrap_or(false),
        "NotIn" => labels
            .get(&req.key)
            .map(|v| !values.contains(v))
            .unwrap_or(true),
        "Exists" => labels.contains_key(&req.key),
        "DoesNotExist" => !labels.contains_key(&req.key),
        // unknown operators select nothing
        _ => false,
    }
}
