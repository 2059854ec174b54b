//! Shared handler state.

use std::sync::Arc;

use worktable_client::{MutationGateway, SubscriptionRegistry};
use worktable_store::MemoryStore;

use crate::config::ServerConfig;

/// Everything a handler needs. Cheap to clone.
#[derive(Clone, Debug)]
pub struct AppState {
    pub store: MemoryStore,
    pub registry: SubscriptionRegistry,
    pub gateway: MutationGateway,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Build a store from `config` with a registry and gateway over it.
    pub fn new(config: ServerConfig) -> Self {
        let store = MemoryStore::new(config.store_config());
        for collection in &config.denied_collections {
            store.deny(collection);
        }
        let registry = SubscriptionRegistry::new(store.shared());
        let gateway = MutationGateway::over_store(store.shared());
        Self {
            store,
            registry,
            gateway,
            config: Arc::new(config),
        }
    }

    /// Terminate every live subscription. New watches are refused afterwards.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}
