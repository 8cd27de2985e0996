//! Reddit listing source.
//!
//! Reads the public `new.json` listing of one subreddit. Reddit throttles
//! anonymous clients aggressively and answers with 429 or 403 under load, so
//! those statuses (and 5xx) are retried with a doubling backoff.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::env_optional;
use crate::error::SourceError;
use crate::pipeline::types::Item;
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::source::Source;
use crate::text::truncate;

const SOURCE_NAME: &str = "reddit";

/// Posts by this account are moderator boilerplate, never listings.
const AUTOMOD_AUTHOR: &str = "AutoModerator";

/// Reddit source configuration.
#[derive(Debug, Clone)]
pub struct RedditConfig {
    pub base_url: String,
    pub subreddit: String,
    pub user_agent: String,
    /// Listing page size (Reddit caps this at 100).
    pub limit: u32,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.reddit.com".to_string(),
            subreddit: "CanadianHardwareSwap".to_string(),
            user_agent: "swap-watch/0.1 (deal alert bot)".to_string(),
            limit: 100,
            request_timeout: Duration::from_secs(10),
            retry: RetryConfig {
                max_attempts: 8,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                jitter_fraction: 0.25,
            },
        }
    }
}

impl RedditConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(base) = env_optional("REDDIT_BASE_URL") {
            config.base_url = base;
        }
        if let Some(sub) = env_optional("REDDIT_SUBREDDIT") {
            config.subreddit = sub;
        }
        if let Some(agent) = env_optional("REDDIT_USER_AGENT") {
            config.user_agent = agent;
        }
        config
    }

    /// Wall-clock bound on one `fetch_batch`, every retry included.
    pub fn retry_budget(&self) -> Duration {
        self.retry.worst_case(self.request_timeout)
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<ListingChild>,
}

#[derive(Debug, Deserialize)]
struct ListingChild {
    data: RedditPost,
}

#[derive(Debug, Deserialize)]
struct RedditPost {
    id: String,
    title: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    permalink: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    num_comments: i64,
    #[serde(default)]
    created_utc: f64,
    link_flair_text: Option<String>,
    removed_by_category: Option<String>,
    thumbnail: Option<String>,
}

impl RedditPost {
    fn into_item(self, base_url: &str) -> Item {
        let url = if self.permalink.is_empty() {
            self.url
        } else {
            format!("{}{}", base_url.trim_end_matches('/'), self.permalink)
        };
        let created_at = DateTime::<Utc>::from_timestamp(self.created_utc as i64, 0)
            .filter(|_| self.created_utc > 0.0);

        Item {
            id: self.id,
            title: self.title,
            body: self.selftext,
            url,
            score: self.score,
            num_comments: self.num_comments,
            flair: self.link_flair_text,
            removed_by: self.removed_by_category,
            thumbnail: self.thumbnail,
            author: self.author,
            created_at,
        }
    }
}

/// Errors inside one listing attempt, before retry classification.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => is_retryable_status(*status),
        }
    }
}

// ── Source implementation ───────────────────────────────────────────

/// Polls a subreddit's newest posts.
pub struct RedditSource {
    client: reqwest::Client,
    config: RedditConfig,
}

impl RedditSource {
    pub fn new(config: RedditConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SourceError::RequestFailed {
                source_name: SOURCE_NAME.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    fn listing_url(&self) -> String {
        format!(
            "{}/r/{}/new.json?limit={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.subreddit,
            self.config.limit
        )
    }

    async fn fetch_listing_once(&self, url: &str) -> Result<String, AttemptError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(AttemptError::Status {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl Source for RedditSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch_batch(&self) -> Result<Vec<Item>, SourceError> {
        let url = self.listing_url();
        debug!(url = %url, "Fetching listing");

        let body = retry_with_backoff(
            &self.config.retry,
            "reddit_listing",
            AttemptError::is_transient,
            || self.fetch_listing_once(&url),
        )
        .await
        .map_err(|e| match e {
            AttemptError::Status { status, body } if !is_retryable_status(status) => {
                SourceError::Status {
                    source_name: SOURCE_NAME.to_string(),
                    status,
                    body,
                }
            }
            other => SourceError::RetriesExhausted {
                source_name: SOURCE_NAME.to_string(),
                attempts: self.config.retry.max_attempts,
                last_error: other.to_string(),
            },
        })?;

        let listing: Listing = serde_json::from_str(&body).map_err(|e| SourceError::Decode {
            source_name: SOURCE_NAME.to_string(),
            reason: e.to_string(),
        })?;

        let total = listing.data.children.len();
        let items: Vec<Item> = listing
            .data
            .children
            .into_iter()
            .map(|child| child.data)
            .filter(|post| post.author != AUTOMOD_AUTHOR)
            .map(|post| post.into_item(&self.config.base_url))
            .collect();

        info!(
            subreddit = %self.config.subreddit,
            fetched = total,
            kept = items.len(),
            "Listing fetched"
        );
        Ok(items)
    }
}

/// Throttling (429, and 403 which Reddit also uses for it) and server errors.
fn is_retryable_status(status: u16) -> bool {
    status == 429 || status == 403 || status >= 500
}
