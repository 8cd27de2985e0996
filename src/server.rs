//! HTTP trigger surface and interval ticker.
//!
//! An external scheduler hits `POST /cron/scrape` to run one batch. The
//! optional ticker does the same from inside the process. Both go through
//! `BatchTrigger`, which allows one run in flight at a time. A batch runs on
//! its own task, so a client hanging up mid-request does not stop it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::{BatchReport, Orchestrator};

/// Why a trigger did not produce a report.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("a batch is already running")]
    Busy,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("batch task ended abnormally: {0}")]
    Aborted(String),
}

/// Single-flight gate in front of the orchestrator.
pub struct BatchTrigger {
    orchestrator: Orchestrator,
    running: Arc<tokio::sync::Mutex<()>>,
    shutdown: CancellationToken,
}

impl BatchTrigger {
    /// `shutdown` cancels any in-flight run when the process stops.
    pub fn new(orchestrator: Orchestrator, shutdown: CancellationToken) -> Self {
        Self {
            orchestrator,
            running: Arc::new(tokio::sync::Mutex::new(())),
            shutdown,
        }
    }

    /// Run one batch unless another is in flight.
    ///
    /// The batch task holds the gate until it finishes, even if the caller
    /// stops waiting for it.
    pub async fn trigger(&self) -> Result<BatchReport, TriggerError> {
        let running = Arc::clone(&self.running)
            .try_lock_owned()
            .map_err(|_| TriggerError::Busy)?;
        let orchestrator = self.orchestrator.clone();
        let cancel = self.shutdown.child_token();

        let batch = tokio::spawn(
            async move {
                let _running = running;
                orchestrator.run_batch(&cancel).await
            }
            .in_current_span(),
        );
        match batch.await {
            Ok(result) => Ok(result?),
            Err(e) => Err(TriggerError::Aborted(e.to_string())),
        }
    }
}

// ── Routes ──────────────────────────────────────────────────────────

pub fn routes(trigger: Arc<BatchTrigger>) -> Router {
    Router::new()
        .route("/cron/scrape", post(run_scrape))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(trigger)
}

async fn run_scrape(State(trigger): State<Arc<BatchTrigger>>) -> Response {
    match trigger.trigger().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(TriggerError::Busy) => {
            warn!("Scrape requested while a batch is running");
            (
                StatusCode::CONFLICT,
                Json(json!({ "error": "batch already running" })),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "Scrape failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ── Ticker ──────────────────────────────────────────────────────────

/// Spawn a background loop that triggers a batch every `interval`.
///
/// Ticks that land while a run is in flight are skipped. The loop exits
/// when `shutdown` fires.
pub fn spawn_poll_ticker(
    trigger: Arc<BatchTrigger>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Poll ticker stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            match trigger.trigger().await {
                Ok(report) => debug!(delivered = report.delivered, "Scheduled batch finished"),
                Err(TriggerError::Busy) => debug!("Previous batch still running, tick skipped"),
                Err(e) => warn!(error = %e, "Scheduled batch failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    use super::*;
    use crate::channels::Messenger;
    use crate::config::PipelineConfig;
    use crate::error::{ChannelError, DatabaseError, LlmError, SourceError};
    use crate::llm::Classifier;
    use crate::pipeline::OrchestratorDeps;
    use crate::pipeline::builder::Presentation;
    use crate::pipeline::types::{AlertRule, ClassifiedSummary, Item, ItemRecord, RoutingConfig};
    use crate::source::Source;
    use crate::store::Store;

    /// Source that can hold a fetch open until released.
    #[derive(Default)]
    struct GatedSource {
        gate: Option<Arc<Notify>>,
        entered: Arc<Notify>,
        fail: bool,
        calls: AtomicUsize,
        /// Fetches that got past the gate.
        released: AtomicUsize,
    }

    #[async_trait]
    impl Source for GatedSource {
        fn name(&self) -> &str {
            "gated"
        }

        async fn fetch_batch(&self) -> Result<Vec<Item>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.released.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SourceError::RequestFailed {
                    source_name: "gated".into(),
                    reason: "listing unavailable".into(),
                });
            }
            Ok(Vec::new())
        }
    }

    /// Store, classifier, and messenger that are never reached with an empty batch.
    struct Idle;

    #[async_trait]
    impl Store for Idle {
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
    impl Classifier for Idle {
        fn model_name(&self) -> &str {
            "idle"
        }
        async fn classify(&self, _: &str, _: &str) -> Result<ClassifiedSummary, LlmError> {
            Err(LlmError::InvalidResponse {
                provider: "idle".into(),
                reason: "not used".into(),
            })
        }
    }

    #[async_trait]
    impl Messenger for Idle {
        fn name(&self) -> &str {
            "idle"
        }
        async fn deliver_new(&self, _: &str, _: &Presentation) -> Result<String, ChannelError> {
            Err(ChannelError::InvalidMessage("not used".into()))
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

    fn trigger_with(source: Arc<GatedSource>) -> Arc<BatchTrigger> {
        let idle = Arc::new(Idle);
        let deps = OrchestratorDeps {
            source,
            store: idle.clone(),
            classifier: idle.clone(),
            messenger: idle,
        };
        Arc::new(BatchTrigger::new(
            Orchestrator::new(deps, PipelineConfig::default()),
            CancellationToken::new(),
        ))
    }

    fn scrape_request() -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/cron/scrape")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = routes(trigger_with(Arc::new(GatedSource::default())));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn scrape_returns_report() {
        let app = routes(trigger_with(Arc::new(GatedSource::default())));
        let resp = app.oneshot(scrape_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let report: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(report["fetched"], 0);
        assert!(report["run_id"].is_string());
    }

    #[tokio::test]
    async fn fatal_source_error_is_500() {
        let source = Arc::new(GatedSource {
            fail: true,
            ..GatedSource::default()
        });
        let resp = routes(trigger_with(source)).oneshot(scrape_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn concurrent_scrape_is_rejected() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(GatedSource {
            gate: Some(gate.clone()),
            ..GatedSource::default()
        });
        let entered = source.entered.clone();
        let trigger = trigger_with(source.clone());

        let first = tokio::spawn({
            let trigger = trigger.clone();
            async move { trigger.trigger().await }
        });
        entered.notified().await;

        let resp = routes(trigger.clone()).oneshot(scrape_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        gate.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // Gate is free again once the first run finished.
        let second = tokio::spawn({
            let trigger = trigger.clone();
            async move { trigger.trigger().await }
        });
        entered.notified().await;
        gate.notify_one();
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn dropped_request_leaves_the_batch_running() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(GatedSource {
            gate: Some(gate.clone()),
            ..GatedSource::default()
        });
        let entered = source.entered.clone();
        let trigger = trigger_with(source.clone());

        let request = tokio::spawn(routes(trigger.clone()).oneshot(scrape_request()));
        entered.notified().await;
        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());

        // The batch still owns the gate after the client went away.
        assert!(matches!(trigger.trigger().await, Err(TriggerError::Busy)));

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), async {
            while trigger.running.try_lock().is_err() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("batch never finished");
        assert_eq!(source.released.load(Ordering::SeqCst), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_run() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(GatedSource {
            gate: Some(gate),
            ..GatedSource::default()
        });
        let entered = source.entered.clone();
        let idle = Arc::new(Idle);
        let shutdown = CancellationToken::new();
        let trigger = Arc::new(BatchTrigger::new(
            Orchestrator::new(
                OrchestratorDeps {
                    source,
                    store: idle.clone(),
                    classifier: idle.clone(),
                    messenger: idle,
                },
                PipelineConfig::default(),
            ),
            shutdown.clone(),
        ));

        let run = tokio::spawn({
            let trigger = trigger.clone();
            async move { trigger.trigger().await }
        });
        entered.notified().await;
        shutdown.cancel();

        let result = run.await.unwrap();
        assert!(matches!(
            result,
            Err(TriggerError::Pipeline(PipelineError::Cancelled))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_runs_batches_until_shutdown() {
        let source = Arc::new(GatedSource::default());
        let trigger = trigger_with(source.clone());
        let shutdown = CancellationToken::new();

        let handle = spawn_poll_ticker(trigger, Duration::from_secs(60), shutdown.clone());
        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
