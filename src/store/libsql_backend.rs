//! libSQL backend: async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. Rule term lists are stored
//! as JSON arrays; deliveries live in their own table keyed by
//! `(external_id, scope_id)` so re-saving a record never rewrites an
//! existing message reference.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{AlertRule, ItemRecord, RoutingConfig};
use crate::store::migrations;
use crate::store::traits::Store;

/// Records kept by `trim_old_records` unless overridden.
pub const DEFAULT_RETENTION_LIMIT: usize = 500;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    retention_limit: usize,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            retention_limit: DEFAULT_RETENTION_LIMIT,
        })
    }

    /// Override how many records survive a trim.
    pub fn with_retention_limit(mut self, limit: usize) -> Self {
        self.retention_limit = limit;
        self
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Seeding (admin tooling and tests) ───────────────────────────

    /// Insert or replace an alert rule.
    pub async fn add_rule(&self, rule: &AlertRule) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO alert_rules
                    (id, owner_id, scope_id, must_have, any_of, must_not, raw_query, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    rule.id.to_string(),
                    rule.owner_id.clone(),
                    rule.scope_id.clone(),
                    terms_to_json(&rule.must_have)?,
                    terms_to_json(&rule.any_of)?,
                    terms_to_json(&rule.must_not)?,
                    rule.raw_query.clone(),
                    format_datetime(&rule.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_rule: {e}")))?;

        debug!(rule_id = %rule.id, scope = %rule.scope_id, "Alert rule saved");
        Ok(())
    }

    /// Delete a rule. Returns whether it existed.
    pub async fn delete_rule(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute("DELETE FROM alert_rules WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: {e}")))?;
        Ok(affected > 0)
    }

    /// Insert or replace a scope's routing config.
    pub async fn save_routing_config(&self, config: &RoutingConfig) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO routing_configs
                    (scope_id, feed_destination, ping_destination, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    config.scope_id.clone(),
                    config.feed_destination.clone(),
                    opt_text(config.ping_destination.as_deref()),
                    format_datetime(&config.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_routing_config: {e}")))?;

        debug!(scope = %config.scope_id, "Routing config saved");
        Ok(())
    }

    async fn load_deliveries(
        &self,
        external_id: &str,
    ) -> Result<BTreeMap<String, String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT scope_id, message_ref FROM item_deliveries WHERE external_id = ?1",
                params![external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_deliveries: {e}")))?;

        let mut deliveries = BTreeMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let scope: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("load_deliveries row: {e}")))?;
            let message_ref: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("load_deliveries row: {e}")))?;
            deliveries.insert(scope, message_ref);
        }
        Ok(deliveries)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical, lexically sortable timestamp format.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn terms_to_json(terms: &[String]) -> Result<String, DatabaseError> {
    serde_json::to_string(terms).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn terms_from_json(raw: &str) -> Result<Vec<String>, DatabaseError> {
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("rule terms '{raw}': {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to an AlertRule.
/// Both retention deletes, run inside the caller's transaction.
async fn trim_in(tx: &Transaction, keep: usize) -> Result<usize, DatabaseError> {
    let removed = tx
        .execute(
            "DELETE FROM item_records WHERE external_id NOT IN (
                SELECT external_id FROM item_records
                ORDER BY first_recorded_at DESC, rowid DESC
                LIMIT ?1
             )",
            params![keep as i64],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("trim_old_records: {e}")))?;

    tx.execute(
        "DELETE FROM item_deliveries
         WHERE external_id NOT IN (SELECT external_id FROM item_records)",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("trim_old_records deliveries: {e}")))?;

    Ok(removed as usize)
}

fn row_to_rule(row: &libsql::Row) -> Result<AlertRule, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("alert_rules row parse: {e}"));

    let id_str: String = row.get(0).map_err(col)?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("rule id '{id_str}': {e}")))?;
    let created_str: String = row.get(7).map_err(col)?;

    Ok(AlertRule {
        id,
        owner_id: row.get(1).map_err(col)?,
        scope_id: row.get(2).map_err(col)?,
        must_have: terms_from_json(&row.get::<String>(3).map_err(col)?)?,
        any_of: terms_from_json(&row.get::<String>(4).map_err(col)?)?,
        must_not: terms_from_json(&row.get::<String>(5).map_err(col)?)?,
        raw_query: row.get(6).map_err(col)?,
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn get_active_rules(&self) -> Result<Vec<AlertRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, owner_id, scope_id, must_have, any_of, must_not, raw_query, created_at
                 FROM alert_rules ORDER BY created_at ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }

    async fn get_item_record(
        &self,
        external_id: &str,
    ) -> Result<Option<ItemRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT cleaned_title, first_recorded_at FROM item_records WHERE external_id = ?1",
                params![external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_item_record: {e}")))?;

        let (cleaned_title, recorded_str) = match rows.next().await {
            Ok(Some(row)) => {
                let title: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_item_record row: {e}")))?;
                let recorded: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("get_item_record row: {e}")))?;
                (title, recorded)
            }
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_item_record: {e}"))),
        };

        Ok(Some(ItemRecord {
            external_id: external_id.to_string(),
            cleaned_title,
            deliveries: self.load_deliveries(external_id).await?,
            first_recorded_at: parse_datetime(&recorded_str),
        }))
    }

    async fn save_item_record(
        &self,
        external_id: &str,
        cleaned_title: &str,
        deliveries: &BTreeMap<String, String>,
    ) -> Result<(), DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("save_item_record begin: {e}")))?;

        tx.execute(
            "INSERT OR IGNORE INTO item_records (external_id, cleaned_title, first_recorded_at)
             VALUES (?1, ?2, ?3)",
            params![external_id, cleaned_title, format_datetime(&Utc::now())],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_item_record: {e}")))?;

        for (scope_id, message_ref) in deliveries {
            tx.execute(
                "INSERT OR IGNORE INTO item_deliveries (external_id, scope_id, message_ref)
                 VALUES (?1, ?2, ?3)",
                params![external_id, scope_id.as_str(), message_ref.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_item_record delivery: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("save_item_record commit: {e}")))?;

        debug!(external_id, scopes = deliveries.len(), "Item record saved");
        Ok(())
    }

    async fn trim_old_records(&self) -> Result<usize, DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("trim_old_records begin: {e}")))?;

        let removed = match trim_in(&tx, self.retention_limit).await {
            Ok(removed) => removed,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "trim_old_records rollback failed");
                }
                return Err(e);
            }
        };

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("trim_old_records commit: {e}")))?;

        if removed > 0 {
            info!(removed, keep = self.retention_limit, "Trimmed old item records");
        }
        Ok(removed)
    }

    async fn get_routing_config(
        &self,
        scope_id: &str,
    ) -> Result<Option<RoutingConfig>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT feed_destination, ping_destination, updated_at
                 FROM routing_configs WHERE scope_id = ?1",
                params![scope_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_routing_config: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let feed_destination: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_routing_config row: {e}")))?;
                let ping_destination: Option<String> = row.get(1).ok();
                let updated_str: String = row
                    .get(2)
                    .map_err(|e| DatabaseError::Query(format!("get_routing_config row: {e}")))?;
                Ok(Some(RoutingConfig {
                    scope_id: scope_id.to_string(),
                    feed_destination,
                    ping_destination: ping_destination.filter(|p| !p.is_empty()),
                    updated_at: parse_datetime(&updated_str),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_routing_config: {e}"))),
        }
    }

    async fn list_scope_ids(&self) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT scope_id FROM routing_configs ORDER BY scope_id", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_scope_ids: {e}")))?;

        let mut scopes = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let scope: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("list_scope_ids row: {e}")))?;
            scopes.push(scope);
        }
        Ok(scopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn routing(scope: &str, feed: &str, ping: Option<&str>) -> RoutingConfig {
        RoutingConfig {
            scope_id: scope.to_string(),
            feed_destination: feed.to_string(),
            ping_destination: ping.map(String::from),
            updated_at: Utc::now(),
        }
    }

    fn deliveries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(s, m)| (s.to_string(), m.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn rules_round_trip_with_term_lists() {
        let db = test_db().await;
        let rule = AlertRule::new("user-1", "scope-a", &["3080"], &["toronto", "ottawa"], &["broken"]);
        db.add_rule(&rule).await.unwrap();

        let rules = db.get_active_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, rule.id);
        assert_eq!(rules[0].any_of, vec!["toronto", "ottawa"]);
        assert_eq!(rules[0].must_not, vec!["broken"]);
        assert_eq!(rules[0].raw_query, rule.raw_query);
    }

    #[tokio::test]
    async fn delete_rule_reports_existence() {
        let db = test_db().await;
        let rule = AlertRule::new("user-1", "scope-a", &["gpu"], &[], &[]);
        db.add_rule(&rule).await.unwrap();

        assert!(db.delete_rule(rule.id).await.unwrap());
        assert!(!db.delete_rule(rule.id).await.unwrap());
        assert!(db.get_active_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_record_is_none() {
        let db = test_db().await;
        assert!(db.get_item_record("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_record() {
        let db = test_db().await;
        db.save_item_record("post1", "RTX 3080", &deliveries(&[("a", "m1"), ("b", "m2")]))
            .await
            .unwrap();

        let record = db.get_item_record("post1").await.unwrap().unwrap();
        assert_eq!(record.cleaned_title, "RTX 3080");
        assert_eq!(record.deliveries, deliveries(&[("a", "m1"), ("b", "m2")]));
    }

    #[tokio::test]
    async fn resave_only_adds_new_scopes() {
        let db = test_db().await;
        db.save_item_record("post1", "first", &deliveries(&[("a", "m1")]))
            .await
            .unwrap();
        db.save_item_record("post1", "second", &deliveries(&[("a", "other"), ("b", "m2")]))
            .await
            .unwrap();

        let record = db.get_item_record("post1").await.unwrap().unwrap();
        assert_eq!(record.cleaned_title, "first");
        assert_eq!(record.deliveries, deliveries(&[("a", "m1"), ("b", "m2")]));
    }

    #[tokio::test]
    async fn trim_keeps_newest_records() {
        let db = test_db().await.with_retention_limit(2);
        for id in ["p1", "p2", "p3", "p4"] {
            db.save_item_record(id, id, &deliveries(&[("a", id)]))
                .await
                .unwrap();
        }

        assert_eq!(db.trim_old_records().await.unwrap(), 2);
        assert!(db.get_item_record("p1").await.unwrap().is_none());
        assert!(db.get_item_record("p2").await.unwrap().is_none());
        assert!(db.get_item_record("p4").await.unwrap().is_some());

        let mut rows = db
            .conn()
            .query("SELECT COUNT(*) FROM item_deliveries", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_trim_leaves_records_untouched() {
        let db = test_db().await.with_retention_limit(1);
        for id in ["p1", "p2", "p3"] {
            db.save_item_record(id, id, &deliveries(&[("a", id)]))
                .await
                .unwrap();
        }
        db.conn()
            .execute("DROP TABLE item_deliveries", ())
            .await
            .unwrap();

        assert!(db.trim_old_records().await.is_err());

        let mut rows = db
            .conn()
            .query("SELECT COUNT(*) FROM item_records", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 3);
    }

    #[tokio::test]
    async fn trim_under_limit_is_noop() {
        let db = test_db().await;
        db.save_item_record("p1", "t", &deliveries(&[("a", "m")]))
            .await
            .unwrap();
        assert_eq!(db.trim_old_records().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn routing_config_round_trip() {
        let db = test_db().await;
        assert!(db.get_routing_config("a").await.unwrap().is_none());

        db.save_routing_config(&routing("a", "feed-1", Some("ping-1")))
            .await
            .unwrap();
        db.save_routing_config(&routing("b", "feed-2", None))
            .await
            .unwrap();

        let a = db.get_routing_config("a").await.unwrap().unwrap();
        assert_eq!(a.feed_destination, "feed-1");
        assert_eq!(a.ping_destination.as_deref(), Some("ping-1"));
        let b = db.get_routing_config("b").await.unwrap().unwrap();
        assert_eq!(b.ping_destination, None);

        assert_eq!(db.list_scope_ids().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn local_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("swap.db");
        {
            let db = LibSqlStore::new_local(&path).await.unwrap();
            db.save_item_record("p1", "t", &deliveries(&[("a", "m")]))
                .await
                .unwrap();
        }
        let db = LibSqlStore::new_local(&path).await.unwrap();
        assert!(db.get_item_record("p1").await.unwrap().is_some());
    }
}
