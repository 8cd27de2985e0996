//! Batch orchestrator: one ingestion run from fetch to trim.
//!
//! Flow:
//! 1. Fetch the batch from the source and all alert rules (both fatal on error)
//! 2. Process items concurrently, bounded by the worker budget:
//!    - known + now closed → edit every delivered feed post
//!    - unknown + open → classify, match rules, post to each scope, ping owners
//!    - unknown + already closed, or known + still open → nothing
//! 3. Save one record per newly delivered item
//! 4. Trim old records
//!
//! Per-item failures never fail the run; they are logged and counted. An
//! item is only recorded once at least one feed post succeeded, so anything
//! that failed outright is retried on the next run.
//!
//! Every collaborator call is bounded by a timeout and abandoned as soon as
//! the run's cancellation token fires. The source fetch and classification
//! get their own budgets, sized to cover the clients' retry schedules.
//!
//! A cancelled run still records every feed post that went out, including
//! the scopes an interrupted item reached, so the next run does not post them
//! again. Trimming is skipped.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::channels::Messenger;
use crate::config::{FeedPolicy, PipelineConfig};
use crate::error::PipelineError;
use crate::llm::Classifier;
use crate::pipeline::builder::{build_closed_presentation, build_new_item_presentation};
use crate::pipeline::matcher::Matcher;
use crate::pipeline::routing_cache::RoutingCache;
use crate::pipeline::types::{AlertRule, ClassifiedSummary, Item, ItemRecord, ScopeMatches};
use crate::source::Source;
use crate::store::Store;

/// Collaborators the orchestrator drives.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub source: Arc<dyn Source>,
    pub store: Arc<dyn Store>,
    pub classifier: Arc<dyn Classifier>,
    pub messenger: Arc<dyn Messenger>,
}

/// Summary of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    /// Items returned by the source (after de-duplication).
    pub fetched: usize,
    pub rules: usize,
    /// New items posted to at least one scope.
    pub delivered: usize,
    /// Individual feed posts across all scopes.
    pub feed_posts: usize,
    /// Feed posts edited to the closed state.
    pub closed_edits: usize,
    /// Known items that are still open.
    pub unchanged: usize,
    /// New items with no matching scope.
    pub unmatched: usize,
    /// Items first seen already closed.
    pub skipped_terminal: usize,
    /// Items abandoned for this run.
    pub failed: usize,
    pub records_saved: usize,
    pub trimmed: usize,
}

/// Feed posts made for one new item, keyed by scope.
#[derive(Debug)]
struct Delivery {
    external_id: String,
    cleaned_title: String,
    deliveries: BTreeMap<String, String>,
}

/// What happened to one item.
#[derive(Debug)]
enum ItemOutcome {
    Delivered(Delivery),
    Closed {
        edited: usize,
        failed: usize,
    },
    Unchanged,
    Unmatched,
    SkippedTerminal,
    Failed,
    /// Stopped by the token, with whatever was posted before it fired.
    Cancelled(Option<Delivery>),
}

/// Runs ingestion batches. Cheap to clone; clones share caches.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

struct Shared {
    deps: OrchestratorDeps,
    matcher: Matcher,
    routing: RoutingCache,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps, config: PipelineConfig) -> Self {
        let routing = RoutingCache::new(deps.store.clone(), config.routing_cache_ttl);
        Self {
            shared: Arc::new(Shared {
                deps,
                matcher: Matcher::new(),
                routing,
                config,
            }),
        }
    }

    /// Run one batch end to end.
    ///
    /// Returns `Err` only for fatal failures (source or rule fetch) and for
    /// cancellation. Everything else is reflected in the report.
    pub async fn run_batch(&self, cancel: &CancellationToken) -> Result<BatchReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("batch", run_id = %run_id);
        self.shared
            .run_batch(run_id, cancel)
            .instrument(span)
            .await
    }
}

impl Shared {
    async fn run_batch(
        self: &Arc<Self>,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, PipelineError> {
        let deps = &self.deps;
        info!(source = deps.source.name(), "Batch started");

        let fetched = self
            .guarded_for(
                "fetch_batch",
                self.config.fetch_timeout,
                cancel,
                deps.source.fetch_batch(),
            )
            .await
            .inspect_err(|e| error!(error = %e, "Source fetch failed, aborting batch"))?;
        let rules = self
            .guarded("get_active_rules", cancel, deps.store.get_active_rules())
            .await
            .inspect_err(|e| error!(error = %e, "Rule fetch failed, aborting batch"))?;
        let all_scopes = match self.config.feed_policy {
            FeedPolicy::AllScopes => self
                .guarded("list_scope_ids", cancel, deps.store.list_scope_ids())
                .await
                .inspect_err(|e| error!(error = %e, "Scope listing failed, aborting batch"))?,
            FeedPolicy::MatchedOnly => Vec::new(),
        };

        let items = dedupe_items(fetched);
        let mut report = BatchReport {
            run_id,
            fetched: items.len(),
            rules: rules.len(),
            ..BatchReport::default()
        };
        info!(items = items.len(), rules = rules.len(), "Batch fetched");

        let rules = Arc::new(rules);
        let all_scopes = Arc::new(all_scopes);
        let permits = Arc::new(Semaphore::new(self.config.worker_budget.max(1)));
        let mut tasks = JoinSet::new();

        for item in items {
            let shared = Arc::clone(self);
            let rules = Arc::clone(&rules);
            let all_scopes = Arc::clone(&all_scopes);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            let span = info_span!("item", id = %item.id);

            tasks.spawn(
                async move {
                    let _permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return ItemOutcome::Cancelled(None),
                        permit = permits.acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return ItemOutcome::Cancelled(None),
                        },
                    };
                    shared.process_item(item, &rules, &all_scopes, &cancel).await
                }
                .instrument(span),
            );
        }

        let mut to_save = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ItemOutcome::Delivered(delivery))
                | Ok(ItemOutcome::Cancelled(Some(delivery))) => {
                    report.delivered += 1;
                    report.feed_posts += delivery.deliveries.len();
                    to_save.push(delivery);
                }
                Ok(ItemOutcome::Closed { edited, failed }) => {
                    report.closed_edits += edited;
                    if failed > 0 {
                        report.failed += 1;
                    }
                }
                Ok(ItemOutcome::Unchanged) => report.unchanged += 1,
                Ok(ItemOutcome::Unmatched) => report.unmatched += 1,
                Ok(ItemOutcome::SkippedTerminal) => report.skipped_terminal += 1,
                Ok(ItemOutcome::Failed) => report.failed += 1,
                Ok(ItemOutcome::Cancelled(None)) => {}
                Err(e) => {
                    error!(error = %e, "Item task panicked");
                    report.failed += 1;
                }
            }
        }

        report.records_saved = self.save_records(&to_save).await;

        if cancel.is_cancelled() {
            warn!(
                delivered = report.delivered,
                records_saved = report.records_saved,
                "Batch cancelled after recording completed posts"
            );
            return Err(PipelineError::Cancelled);
        }

        match self
            .guarded("trim_old_records", cancel, deps.store.trim_old_records())
            .await
        {
            Ok(trimmed) => report.trimmed = trimmed,
            Err(e) => warn!(error = %e, "Record trim failed"),
        }

        info!(
            fetched = report.fetched,
            delivered = report.delivered,
            feed_posts = report.feed_posts,
            closed_edits = report.closed_edits,
            skipped_terminal = report.skipped_terminal,
            failed = report.failed,
            records_saved = report.records_saved,
            trimmed = report.trimmed,
            "Batch complete"
        );
        Ok(report)
    }

    /// Record every delivered item. Runs without the token so posts made
    /// before a cancellation are still remembered.
    async fn save_records(&self, to_save: &[Delivery]) -> usize {
        let timeout = self.config.call_timeout;
        let mut saved = 0;
        for delivery in to_save {
            let call = self.deps.store.save_item_record(
                &delivery.external_id,
                &delivery.cleaned_title,
                &delivery.deliveries,
            );
            match tokio::time::timeout(timeout, call).await {
                Ok(Ok(())) => saved += 1,
                Ok(Err(e)) => {
                    error!(id = %delivery.external_id, error = %e, "Failed to save item record");
                }
                Err(_) => {
                    error!(
                        id = %delivery.external_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Item record save timed out"
                    );
                }
            }
        }
        saved
    }

    /// Bound a store or messenger call by `call_timeout` and the run's token.
    async fn guarded<T, E>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, PipelineError>
    where
        PipelineError: From<E>,
    {
        self.guarded_for(operation, self.config.call_timeout, cancel, call)
            .await
    }

    async fn guarded_for<T, E>(
        &self,
        operation: &'static str,
        timeout: Duration,
        cancel: &CancellationToken,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, PipelineError>
    where
        PipelineError: From<E>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(inner) => inner.map_err(PipelineError::from),
                Err(_) => Err(PipelineError::Timeout { operation, timeout }),
            },
        }
    }

    async fn process_item(
        &self,
        item: Item,
        rules: &[AlertRule],
        all_scopes: &[String],
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        let lookup = self
            .guarded(
                "get_item_record",
                cancel,
                self.deps.store.get_item_record(&item.id),
            )
            .await;
        let record = match lookup {
            Ok(record) => record,
            Err(e) if e.is_not_found() => None,
            Err(PipelineError::Cancelled) => return ItemOutcome::Cancelled(None),
            Err(e) => {
                // Unknown state: delivering could duplicate an existing post.
                warn!(error = %e, "Record lookup failed, skipping item this run");
                return ItemOutcome::Failed;
            }
        };

        let terminal = item.is_terminal(&self.config.terminal_flairs);
        match (record, terminal) {
            (Some(record), true) => self.close_existing(&item, &record, cancel).await,
            (Some(_), false) => ItemOutcome::Unchanged,
            (None, true) => {
                debug!(flair = ?item.flair, "First seen already closed, skipping");
                ItemOutcome::SkippedTerminal
            }
            (None, false) => self.deliver_new_item(&item, rules, all_scopes, cancel).await,
        }
    }

    // ── Lifecycle path ──────────────────────────────────────────────

    async fn close_existing(
        &self,
        item: &Item,
        record: &ItemRecord,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        let status = item.status_label(&self.config.terminal_flairs);
        let closed = build_closed_presentation(&record.cleaned_title, &item.url, &status);
        let mut edited = 0;
        let mut failed = 0;

        for (scope, message_ref) in &record.deliveries {
            let routing = match self
                .guarded(
                    "get_routing_config",
                    cancel,
                    self.routing.get_routing_config(scope),
                )
                .await
            {
                Ok(routing) => routing,
                Err(PipelineError::Cancelled) => return ItemOutcome::Cancelled(None),
                Err(e) => {
                    warn!(scope = %scope, error = %e, "No routing for closed edit");
                    failed += 1;
                    continue;
                }
            };

            match self
                .guarded(
                    "edit_existing",
                    cancel,
                    self.deps
                        .messenger
                        .edit_existing(&routing.feed_destination, message_ref, &closed),
                )
                .await
            {
                Ok(()) => edited += 1,
                Err(PipelineError::Cancelled) => return ItemOutcome::Cancelled(None),
                Err(e) => {
                    warn!(scope = %scope, message_ref = %message_ref, error = %e, "Closed edit failed");
                    failed += 1;
                }
            }
        }

        info!(status = %status, edited, failed, "Item closed");
        ItemOutcome::Closed { edited, failed }
    }

    // ── New-item path ───────────────────────────────────────────────

    async fn deliver_new_item(
        &self,
        item: &Item,
        rules: &[AlertRule],
        all_scopes: &[String],
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        let summary = match self
            .guarded_for(
                "classify",
                self.config.classify_timeout,
                cancel,
                self.deps.classifier.classify(&item.title, &item.body),
            )
            .await
        {
            Ok(summary) => summary,
            Err(PipelineError::Cancelled) => return ItemOutcome::Cancelled(None),
            Err(e) => {
                warn!(error = %e, "Classification failed, skipping item this run");
                return ItemOutcome::Failed;
            }
        };

        let mut targets = self.match_scopes(&summary, rules);
        if self.config.feed_policy == FeedPolicy::AllScopes {
            for scope in all_scopes {
                targets.entry(scope.clone()).or_default();
            }
        }
        if targets.is_empty() {
            debug!(title = %summary.title, "No scope matched");
            return ItemOutcome::Unmatched;
        }

        let presentation = build_new_item_presentation(item, &summary);
        let messenger = &self.deps.messenger;
        let mut deliveries = BTreeMap::new();

        for (scope, owners) in &targets {
            let routing = match self
                .guarded(
                    "get_routing_config",
                    cancel,
                    self.routing.get_routing_config(scope),
                )
                .await
            {
                Ok(routing) => routing,
                Err(PipelineError::Cancelled) => break,
                Err(e) => {
                    warn!(scope = %scope, error = %e, "No routing config, skipping scope");
                    continue;
                }
            };

            let message_ref = match self
                .guarded(
                    "deliver_new",
                    cancel,
                    messenger.deliver_new(&routing.feed_destination, &presentation),
                )
                .await
            {
                Ok(message_ref) => message_ref,
                Err(PipelineError::Cancelled) => break,
                Err(e) => {
                    warn!(scope = %scope, error = %e, "Feed delivery failed");
                    continue;
                }
            };
            deliveries.insert(scope.clone(), message_ref.clone());

            for emoji in &self.config.feed_reactions {
                if let Err(e) = self
                    .guarded(
                        "add_reaction",
                        cancel,
                        messenger.add_reaction(&routing.feed_destination, &message_ref, emoji),
                    )
                    .await
                {
                    debug!(scope = %scope, emoji = %emoji, error = %e, "Reaction failed");
                }
            }

            let Some(ping) = routing.ping_destination.as_deref() else {
                continue;
            };
            if owners.is_empty() {
                continue;
            }
            let owners: Vec<String> = owners.iter().cloned().collect();
            let link = messenger.message_link(scope, &routing.feed_destination, &message_ref);
            if let Err(e) = self
                .guarded(
                    "notify_subscribers",
                    cancel,
                    messenger.notify_subscribers(ping, &owners, &link),
                )
                .await
            {
                warn!(scope = %scope, owners = owners.len(), error = %e, "Subscriber ping failed");
            }
        }

        let delivery = (!deliveries.is_empty()).then(|| Delivery {
            external_id: item.id.clone(),
            cleaned_title: summary.title.clone(),
            deliveries,
        });

        if cancel.is_cancelled() {
            if let Some(delivery) = &delivery {
                info!(scopes = delivery.deliveries.len(), "Item interrupted after partial delivery");
            }
            return ItemOutcome::Cancelled(delivery);
        }
        let Some(delivery) = delivery else {
            warn!(scopes = targets.len(), "Every delivery failed, item will be retried");
            return ItemOutcome::Failed;
        };

        info!(
            title = %summary.title,
            scopes = delivery.deliveries.len(),
            "Item delivered"
        );
        ItemOutcome::Delivered(delivery)
    }

    /// Owners per scope whose rules match the item.
    fn match_scopes(&self, summary: &ClassifiedSummary, rules: &[AlertRule]) -> ScopeMatches {
        let corpus = summary.corpus();
        let mut matches: ScopeMatches = BTreeMap::new();
        for rule in rules {
            if self.matcher.matches_rule(&corpus, rule) {
                matches
                    .entry(rule.scope_id.clone())
                    .or_insert_with(BTreeSet::new)
                    .insert(rule.owner_id.clone());
            }
        }
        matches
    }
}

/// Drop repeated ids, keeping the first occurrence.
fn dedupe_items(items: Vec<Item>) -> Vec<Item> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> Item {
        Item {
            id: id.to_string(),
            title: String::new(),
            body: String::new(),
            url: String::new(),
            score: 0,
            num_comments: 0,
            flair: None,
            removed_by: None,
            thumbnail: None,
            author: String::new(),
            created_at: None,
        }
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let mut second = item("a");
        second.title = "dup".into();
        let items = dedupe_items(vec![item("a"), item("b"), second]);
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(items[0].title.is_empty());
    }

    #[test]
    fn owners_are_grouped_by_scope() {
        let shared = Shared {
            deps: null_deps(),
            matcher: Matcher::new(),
            routing: RoutingCache::new(Arc::new(NullStore), std::time::Duration::from_secs(1)),
            config: PipelineConfig::default(),
        };
        let summary = ClassifiedSummary {
            title: "RTX 3080ti".into(),
            location: Some("Toronto".into()),
            ..Default::default()
        };
        let rules = vec![
            AlertRule::new("u1", "s1", &["3080ti"], &[], &[]),
            AlertRule::new("u2", "s1", &["rtx"], &["toronto"], &[]),
            AlertRule::new("u1", "s1", &["toronto"], &[], &[]),
            AlertRule::new("u3", "s2", &["3080"], &[], &[]),
            AlertRule::new("u4", "s3", &["rtx"], &[], &[]),
        ];

        let matches = shared.match_scopes(&summary, &rules);
        assert_eq!(matches.len(), 2);
        assert_eq!(
            matches["s1"].iter().cloned().collect::<Vec<_>>(),
            vec!["u1", "u2"]
        );
        assert!(!matches.contains_key("s2"));
        assert!(matches["s3"].contains("u4"));
    }

    // ── Minimal collaborators ───────────────────────────────────────

    use async_trait::async_trait;

    use crate::error::{ChannelError, DatabaseError, LlmError, SourceError};
    use crate::pipeline::builder::Presentation;
    use crate::pipeline::types::RoutingConfig;

    struct NullStore;
    struct NullSide;

    fn null_deps() -> OrchestratorDeps {
        OrchestratorDeps {
            source: Arc::new(NullSide),
            store: Arc::new(NullStore),
            classifier: Arc::new(NullSide),
            messenger: Arc::new(NullSide),
        }
    }

    #[async_trait]
    impl Store for NullStore {
        async fn get_active_rules(&self) -> Result<Vec<AlertRule>, DatabaseError> {
            Ok(Vec::new())
        }
        async fn get_item_record(&self, _: &str) -> Result<Option<ItemRecord>, DatabaseError> {
            Ok(None)
        }
        async fn save_item_record(
            &self,
            _: &str,
            _: &str,
            _: &BTreeMap<String, String>,
        ) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn trim_old_records(&self) -> Result<usize, DatabaseError> {
            Ok(0)
        }
        async fn get_routing_config(
            &self,
            _: &str,
        ) -> Result<Option<RoutingConfig>, DatabaseError> {
            Ok(None)
        }
        async fn list_scope_ids(&self) -> Result<Vec<String>, DatabaseError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl Source for NullSide {
        fn name(&self) -> &str {
            "null"
        }
        async fn fetch_batch(&self) -> Result<Vec<Item>, SourceError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl Classifier for NullSide {
        fn model_name(&self) -> &str {
            "null"
        }
        async fn classify(&self, title: &str, _: &str) -> Result<ClassifiedSummary, LlmError> {
            Ok(ClassifiedSummary {
                title: title.to_string(),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl Messenger for NullSide {
        fn name(&self) -> &str {
            "null"
        }
        async fn deliver_new(&self, _: &str, _: &Presentation) -> Result<String, ChannelError> {
            Ok("m".into())
        }
        async fn notify_subscribers(
            &self,
            _: &str,
            _: &[String],
            _: &str,
        ) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn edit_existing(
            &self,
            _: &str,
            _: &str,
            _: &Presentation,
        ) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_batch_reports_zeroes() {
        let orchestrator = Orchestrator::new(null_deps(), PipelineConfig::default());
        let report = orchestrator
            .run_batch(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(report.records_saved, 0);
    }
}
