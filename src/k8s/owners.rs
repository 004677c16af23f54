//! Owner reference walking over a snapshot

use std::collections::HashSet;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::Serialize;

use super::cache::Snapshot;

/// Longest owner chain followed before giving up
pub const MAX_OWNER_DEPTH: usize = 10;

/// One link of an owner chain. `kind` is lowercased (`deployment`, `job`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

/// Follow controller references upwards from `meta`, nearest owner first.
///
/// Owners that are not in the snapshot (unknown kinds, or objects deleted
/// between listings) end the chain after being recorded. Cycles and chains
/// deeper than [`MAX_OWNER_DEPTH`] are cut off.
pub fn resolve_owner_chain(snapshot: &Snapshot, meta: &ObjectMeta) -> Vec<OwnerRef> {
    let namespace = meta.namespace.clone().unwrap_or_default();
    let mut chain = Vec::new();
    let mut visited: HashSet<(String, String)> = HashSet::new();
    let mut current = controller_of(meta);

    while let Some(owner) = current {
        if chain.len() >= MAX_OWNER_DEPTH {
            break;
        }
        if !visited.insert((owner.kind.clone(), owner.name.clone())) {
            break;
        }

        let parent_meta = match owner.kind.as_str() {
            "ReplicaSet" => snapshot
                .get::<ReplicaSet>(&namespace, &owner.name)
                .map(|o| &o.metadata),
            "Deployment" => snapshot
                .get::<Deployment>(&namespace, &owner.name)
                .map(|o| &o.metadata),
            "DaemonSet" => snapshot
                .get::<DaemonSet>(&namespace, &owner.name)
                .map(|o| &o.metadata),
            "StatefulSet" => snapshot
                .get::<StatefulSet>(&namespace, &owner.name)
                .map(|o| &o.metadata),
            _ => None,
        };

        chain.push(OwnerRef {
            kind: owner.kind.to_lowercase(),
            name: owner.name.clone(),
        });
        current = parent_meta.and_then(controller_of);
    }

    chain
}

/// The controlling owner, falling back to the first reference
fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    let refs = meta.owner_references.as_ref()?;
    refs.iter()
        .find(|r| r.controller == Some(true))
        .or_else(|| refs.first())
}
