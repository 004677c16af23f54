use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::Config;

/// Label or annotation opting an object out of discovery
pub const DISCOVERY_DISABLED_KEY: &str = "kubefault.io/discovery-disabled";

/// Whether discovery must skip the object
pub fn is_excluded(meta: &ObjectMeta, config: &Config) -> bool {
    if config.disable_discovery_excludes {
        return false;
    }

    if let Some(ns) = meta.namespace.as_deref() {
        if config.excluded_namespaces.iter().any(|n| n == ns) {
            return true;
        }
    }

    let flagged = |map: &Option<std::collections::BTreeMap<String, String>>| {
        map.as_ref()
            .and_then(|m| m.get(DISCOVERY_DISABLED_KEY))
            .is_some_and(|v| v == "true")
    };
    flagged(&meta.labels) || flagged(&meta.annotations)
}
