pub mod actions;
pub mod discovery;
pub mod health;
pub mod response;

use std::sync::Arc;

use crate::chaos::ActionEngine;
use crate::config::Config;
use crate::db::Database;
use crate::discovery::DiscoveryEngine;
use crate::k8s::{ClusterApi, SnapshotCache};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub api: Arc<dyn ClusterApi>,
    pub cache: Arc<SnapshotCache>,
    pub discovery: DiscoveryEngine,
    pub engine: ActionEngine,
}

impl AppState {
    pub fn new(config: Arc<Config>, api: Arc<dyn ClusterApi>, cache: Arc<SnapshotCache>) -> Self {
        let discovery = DiscoveryEngine::new(config.clone());
        let engine = ActionEngine::new(api.clone(), cache.clone(), config.clone());
        Self {
            config,
            api,
            cache,
            discovery,
            engine,
        }
    }

    /// Persist started actions for crash recovery
    pub fn with_store(mut self, db: Database) -> Self {
        self.engine = self.engine.with_store(db);
        self
    }
}
