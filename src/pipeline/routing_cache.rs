//! TTL cache in front of `Store::get_routing_config`.
//!
//! Routing configs change rarely but are read once per delivered scope, so a
//! short-lived cache removes most store round-trips during a batch. Only
//! successful lookups are cached; a missing config or a store error is
//! returned to the caller and the next lookup goes to the store again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::DatabaseError;
use crate::pipeline::types::RoutingConfig;
use crate::store::Store;

struct CacheEntry {
    config: RoutingConfig,
    expires_at: Instant,
}

/// Shared, read-mostly cache of routing configs keyed by scope id.
pub struct RoutingCache {
    store: Arc<dyn Store>,
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl RoutingCache {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Routing config for `scope_id`, served from cache while fresh.
    ///
    /// A scope with no config yields `DatabaseError::NotFound`.
    pub async fn get_routing_config(&self, scope_id: &str) -> Result<RoutingConfig, DatabaseError> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(scope_id) {
                if Instant::now() < entry.expires_at {
                    return Ok(entry.config.clone());
                }
            }
        }

        let config = self
            .store
            .get_routing_config(scope_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("routing_config", scope_id))?;

        debug!(scope = scope_id, ttl_secs = self.ttl.as_secs(), "Routing config cached");
        self.entries.write().await.insert(
            scope_id.to_string(),
            CacheEntry {
                config: config.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(config)
    }
}
