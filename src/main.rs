use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use swap_watch::channels::{DiscordConfig, DiscordMessenger};
use swap_watch::config::AppConfig;
use swap_watch::llm::{GeminiClassifier, GeminiConfig};
use swap_watch::pipeline::{Orchestrator, OrchestratorDeps};
use swap_watch::server::{self, BatchTrigger};
use swap_watch::source::{RedditConfig, RedditSource};
use swap_watch::store::LibSqlStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut config = AppConfig::from_env().context("invalid configuration")?;
    let reddit_config = RedditConfig::from_env();
    let gemini_config = GeminiConfig::from_env().context("Gemini classifier")?;
    let discord_config = DiscordConfig::from_env().context("Discord messenger")?;

    // Never cut a client off in the middle of its own retry schedule
    let pipeline = &mut config.pipeline;
    pipeline.fetch_timeout = pipeline.fetch_timeout.max(reddit_config.retry_budget());
    pipeline.classify_timeout = pipeline.classify_timeout.max(gemini_config.retry_budget());

    eprintln!("📦 swap-watch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Subreddit: r/{}", reddit_config.subreddit);
    eprintln!("   Model: {}", gemini_config.model);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Trigger: http://0.0.0.0:{}/cron/scrape", config.port);
    eprintln!(
        "   Workers: {}, feed policy: {}",
        config.pipeline.worker_budget, config.pipeline.feed_policy
    );
    eprintln!(
        "   Budgets: fetch {}s, classify {}s, calls {}s",
        config.pipeline.fetch_timeout.as_secs(),
        config.pipeline.classify_timeout.as_secs(),
        config.pipeline.call_timeout.as_secs()
    );
    match config.poll_interval {
        Some(every) => eprintln!("   Polling: every {}s", every.as_secs()),
        None => eprintln!("   Polling: disabled (external trigger only)"),
    }

    // ── Collaborators ────────────────────────────────────────────────────
    let store = LibSqlStore::new_local(&config.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?
        .with_retention_limit(config.pipeline.retention_limit);

    let deps = OrchestratorDeps {
        source: Arc::new(RedditSource::new(reddit_config)?),
        store: Arc::new(store),
        classifier: Arc::new(GeminiClassifier::new(gemini_config)?),
        messenger: Arc::new(DiscordMessenger::new(discord_config)),
    };
    let orchestrator = Orchestrator::new(deps, config.pipeline.clone());

    // ── Trigger surfaces ─────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let trigger = Arc::new(BatchTrigger::new(orchestrator, shutdown.clone()));

    let ticker = config.poll_interval.map(|every| {
        server::spawn_poll_ticker(Arc::clone(&trigger), every, shutdown.clone())
    });

    let app = server::routes(Arc::clone(&trigger));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Trigger server started");

    let on_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
            tracing::info!("Shutting down");
            on_shutdown.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Some(ticker) = ticker {
        ticker.await.ok();
    }
    Ok(())
}
