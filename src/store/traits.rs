//! `Store` trait: the pipeline's single async persistence interface.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::pipeline::types::{AlertRule, ItemRecord, RoutingConfig};

/// Backend-agnostic persistence for rules, routing, and delivery records.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Rules ───────────────────────────────────────────────────────

    /// Every active alert rule across all scopes.
    async fn get_active_rules(&self) -> Result<Vec<AlertRule>, DatabaseError>;

    // ── Records ─────────────────────────────────────────────────────

    /// Delivery record for an external item, if it was ever delivered.
    async fn get_item_record(&self, external_id: &str)
    -> Result<Option<ItemRecord>, DatabaseError>;

    /// Upsert a record. The first write's title and timestamp win; delivery
    /// entries are added only for scopes not already present.
    async fn save_item_record(
        &self,
        external_id: &str,
        cleaned_title: &str,
        deliveries: &BTreeMap<String, String>,
    ) -> Result<(), DatabaseError>;

    /// Delete all but the newest records. Returns how many were removed.
    async fn trim_old_records(&self) -> Result<usize, DatabaseError>;

    // ── Routing ─────────────────────────────────────────────────────

    async fn get_routing_config(
        &self,
        scope_id: &str,
    ) -> Result<Option<RoutingConfig>, DatabaseError>;

    /// Scope ids that have a routing config.
    async fn list_scope_ids(&self) -> Result<Vec<String>, DatabaseError>;
}
