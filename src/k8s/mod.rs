//! Kubernetes integration for kubefault
//!
//! This module handles all reads and writes against the API server:
//! - The [`ClusterApi`] seam and its kube-backed implementation
//! - The periodically refreshed snapshot cache used by discovery
//! - Label selector evaluation and owner chain resolution over snapshots

pub mod cache;
mod client;
pub mod owners;
pub mod selector;

pub use cache::{CachedResource, KindListing, ResourceKind, Snapshot, SnapshotCache};
#[cfg(test)]
pub use client::MockClusterApi;
pub use client::{ClusterApi, K8sClient, WorkloadKind};
pub use owners::{resolve_owner_chain, OwnerRef, MAX_OWNER_DEPTH};
