//! Configuration types.
//!
//! Every struct has a `Default` that works for a local run. `from_env`
//! layers environment overrides on top and rejects values that do not parse.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Which scopes receive a feed post for a new item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedPolicy {
    /// Only scopes with at least one matching rule.
    #[default]
    MatchedOnly,
    /// Every scope with a routing config, subscribers or not.
    AllScopes,
}

impl FromStr for FeedPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "matched" | "matched_only" => Ok(Self::MatchedOnly),
            "all" | "all_scopes" => Ok(Self::AllScopes),
            other => Err(ConfigError::InvalidValue {
                key: "SWAP_WATCH_FEED_POLICY".to_string(),
                message: format!("expected 'matched' or 'all', got '{other}'"),
            }),
        }
    }
}

/// Batch pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum number of items processed concurrently.
    pub worker_budget: usize,
    /// How long a routing config stays cached.
    pub routing_cache_ttl: Duration,
    /// Upper bound on a store or messenger call.
    pub call_timeout: Duration,
    /// Upper bound on the source fetch, retries included.
    pub fetch_timeout: Duration,
    /// Upper bound on one classification, retries included.
    pub classify_timeout: Duration,
    /// Number of item records kept after a run.
    pub retention_limit: usize,
    /// Flair labels (lower-case) that mark an item as closed.
    pub terminal_flairs: Vec<String>,
    pub feed_policy: FeedPolicy,
    /// Reactions added under every feed post, best-effort.
    pub feed_reactions: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_budget: 10,
            routing_cache_ttl: Duration::from_secs(300), // 5 minutes
            call_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(360),
            classify_timeout: Duration::from_secs(120),
            retention_limit: 500,
            terminal_flairs: vec!["sold".to_string(), "closed".to_string()],
            feed_policy: FeedPolicy::MatchedOnly,
            feed_reactions: vec!["👍".to_string(), "👎".to_string()],
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(n) = env_parse::<usize>("SWAP_WATCH_WORKERS")? {
            if n == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "SWAP_WATCH_WORKERS".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.worker_budget = n;
        }
        if let Some(secs) = env_parse::<u64>("SWAP_WATCH_CACHE_TTL_SECS")? {
            config.routing_cache_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SWAP_WATCH_CALL_TIMEOUT_SECS")? {
            config.call_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SWAP_WATCH_FETCH_TIMEOUT_SECS")? {
            config.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SWAP_WATCH_CLASSIFY_TIMEOUT_SECS")? {
            config.classify_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("SWAP_WATCH_RETENTION")? {
            config.retention_limit = n;
        }
        if let Some(list) = env_list("SWAP_WATCH_TERMINAL_FLAIRS") {
            config.terminal_flairs = list.into_iter().map(|f| f.to_lowercase()).collect();
        }
        if let Some(policy) = env_parse::<FeedPolicy>("SWAP_WATCH_FEED_POLICY")? {
            config.feed_policy = policy;
        }
        if let Some(list) = env_list("SWAP_WATCH_FEED_REACTIONS") {
            config.feed_reactions = list;
        }
        Ok(config)
    }
}

/// Process-level settings read by the binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    /// When set, batches also run on this interval.
    pub poll_interval: Option<Duration>,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("SWAP_WATCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/swap-watch.db"));
        let port = env_parse::<u16>("PORT")?.unwrap_or(8080);
        let poll_interval = env_parse::<u64>("SWAP_WATCH_POLL_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            db_path,
            port,
            poll_interval,
            pipeline: PipelineConfig::from_env()?,
        })
    }
}

// ── Env helpers ─────────────────────────────────────────────────────

/// Read a required variable.
pub(crate) fn env_required(key: &str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingEnvVar(key.to_string())),
    }
}

/// Read an optional variable, treating blank as unset.
pub(crate) fn env_optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_optional(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env_optional(key).map(|raw| parse_list(&raw))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl std::fmt::Display for FeedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MatchedOnly => write!(f, "matched"),
            Self::AllScopes => write!(f, "all"),
        }
    }
}
