//! Attribute map construction and filtering

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// Ordered attribute map under construction
#[derive(Debug, Default)]
pub struct Attributes {
    map: BTreeMap<String, Vec<String>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single-valued attribute
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.map.insert(key.into(), vec![value.into()]);
        self
    }

    /// Set a multi-valued attribute; empty value lists are skipped
    pub fn set_all(&mut self, key: impl Into<String>, values: Vec<String>) -> &mut Self {
        if !values.is_empty() {
            self.map.insert(key.into(), values);
        }
        self
    }

    /// Emit `<prefix><key>` for every label not in `label_filter`
    pub fn labels(
        &mut self,
        prefix: &str,
        labels: &BTreeMap<String, String>,
        label_filter: &[String],
    ) -> &mut Self {
        for (key, value) in labels {
            if !label_filter.iter().any(|f| f == key) {
                self.map.insert(format!("{prefix}{key}"), vec![value.clone()]);
            }
        }
        self
    }

    /// Container ids of `pods` with and without the runtime prefix
    pub fn container_ids<'a>(&mut self, pods: impl IntoIterator<Item = &'a Pod>) -> &mut Self {
        let mut ids = Vec::new();
        for pod in pods {
            ids.extend(container_statuses(pod).filter_map(|c| c.container_id.clone()));
        }
        let stripped = ids.iter().map(|id| strip_container_id(id).to_string()).collect();
        self.set_all("k8s.container.id", ids);
        self.set_all("k8s.container.id.stripped", stripped);
        self
    }

    /// Pod names, container ids and node names of a workload's pods
    pub fn workload_pods(&mut self, pods: &[&Pod]) -> &mut Self {
        let names = pods.iter().map(|p| p.name_any()).collect();
        let hostnames = pods
            .iter()
            .filter_map(|p| p.spec.as_ref().and_then(|s| s.node_name.clone()))
            .collect();
        self.set_all("k8s.pod.name", names);
        self.container_ids(pods.iter().copied());
        self.set_all("host.hostname", hostnames);
        self
    }

    pub fn build(self) -> BTreeMap<String, Vec<String>> {
        self.map
    }
}

/// Statuses with a container id assigned by the runtime
pub(crate) fn container_statuses(
    pod: &Pod,
) -> impl Iterator<Item = &k8s_openapi::api::core::v1::ContainerStatus> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .into_iter()
        .flatten()
        .filter(|c| c.container_id.as_deref().is_some_and(|id| !id.is_empty()))
}

/// `containerd://abc` becomes `abc`; ids without a runtime prefix are kept
pub fn strip_container_id(id: &str) -> &str {
    id.split_once("://").map(|(_, rest)| rest).unwrap_or(id)
}

/// Remove every key matching an exclude pattern. A pattern is an exact key,
/// or a prefix when it ends in `*`.
pub fn apply_attribute_excludes(attributes: &mut BTreeMap<String, Vec<String>>, patterns: &[String]) {
    if patterns.is_empty() {
        return;
    }
    attributes.retain(|key, _| !patterns.iter().any(|p| pattern_matches(p, key)));
}

fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => pattern == key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_container_id() {
        assert_eq!(strip_container_id("containerd://abc123"), "abc123");
        assert_eq!(strip_container_id("docker://x://y"), "x://y");
        assert_eq!(strip_container_id("plain"), "plain");
    }

    #[test]
    fn test_excludes_exact_and_wildcard() {
        let mut attrs: BTreeMap<String, Vec<String>> = [
            ("k8s.label.app", "web"),
            ("k8s.label.tier", "front"),
            ("k8s.namespace", "default"),
            ("k8s.node.name", "n1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
        .collect();

        apply_attribute_excludes(&mut attrs, &["k8s.label.*".to_string(), "k8s.node.name".to_string()]);

        assert_eq!(attrs.keys().collect::<Vec<_>>(), vec!["k8s.namespace"]);
    }

    #[test]
    fn test_label_filter() {
        let labels: BTreeMap<String, String> = [
            ("app".to_string(), "web".to_string()),
            ("pod-template-hash".to_string(), "abc".to_string()),
        ]
        .into();
        let mut attrs = Attributes::new();
        attrs.labels("k8s.label.", &labels, &["pod-template-hash".to_string()]);
        let map = attrs.build();
        assert!(map.contains_key("k8s.label.app"));
        assert!(!map.contains_key("k8s.label.pod-template-hash"));
    }

    #[test]
    fn test_empty_multi_value_is_skipped() {
        let mut attrs = Attributes::new();
        attrs.set_all("k8s.pod.name", Vec::new());
        assert!(attrs.build().is_empty());
    }
}
