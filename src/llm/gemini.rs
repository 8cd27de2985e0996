//! Gemini classifier built on rig-core's structured extraction.
//!
//! The listing goes to rig's `Extractor`, which hands the model the
//! `ClassifiedSummary` JSON schema as a `submit` tool and decodes the call
//! arguments. Retries, per-attempt timeouts and title cleanup stay here.

use std::time::Duration;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::extractor::ExtractionError;
use rig::providers::gemini;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::config::{env_optional, env_required};
use crate::error::{ConfigError, LlmError};
use crate::llm::{CLASSIFY_SYSTEM_PROMPT, Classifier, normalize_summary};
use crate::pipeline::types::ClassifiedSummary;
use crate::retry::{RetryConfig, retry_with_backoff};

const PROVIDER: &str = "gemini";

/// Raw listing text beyond this many chars is dropped before prompting.
const MAX_BODY_CHARS: usize = 4000;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
    /// Bound on a single attempt.
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            model: "gemini-2.5-flash-lite".to_string(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(env_required("GEMINI_API_KEY")?);
        if let Some(model) = env_optional("GEMINI_MODEL") {
            config.model = model;
        }
        if let Some(base) = env_optional("GEMINI_BASE_URL") {
            config.base_url = base;
        }
        Ok(config)
    }

    /// Wall-clock bound on one `classify`, every retry included.
    pub fn retry_budget(&self) -> Duration {
        self.retry.worst_case(self.request_timeout)
    }
}

/// Classifier backed by Google's Gemini API.
pub struct GeminiClassifier {
    client: gemini::Client,
    config: GeminiConfig,
}

impl GeminiClassifier {
    pub fn new(config: GeminiConfig) -> Result<Self, LlmError> {
        let client = gemini::Client::builder()
            .api_key(config.api_key.expose_secret())
            .base_url(&config.base_url)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to create Gemini client: {e}"),
            })?;
        info!(model = %config.model, "Using Gemini classifier");
        Ok(Self { client, config })
    }

    async fn extract_once(&self, prompt: &str) -> Result<ClassifiedSummary, LlmError> {
        let extractor = self
            .client
            .extractor::<ClassifiedSummary>(self.config.model.as_str())
            .preamble(CLASSIFY_SYSTEM_PROMPT)
            .build();

        match tokio::time::timeout(self.config.request_timeout, extractor.extract(prompt)).await {
            Ok(Ok(summary)) => Ok(summary),
            Ok(Err(e)) => Err(map_extraction_error(e)),
            Err(_) => Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!(
                    "no response within {}s",
                    self.config.request_timeout.as_secs()
                ),
            }),
        }
    }
}

/// Transport and provider failures are worth another attempt; a response
/// that never produced a usable summary is not.
fn map_extraction_error(err: ExtractionError) -> LlmError {
    match err {
        ExtractionError::CompletionError(e) => LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        },
        other => LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: other.to_string(),
        },
    }
}

fn build_prompt(raw_title: &str, raw_body: &str) -> String {
    let body: String = raw_body.chars().take(MAX_BODY_CHARS).collect();
    format!("Title: {raw_title}\n\nBody:\n{body}")
}

#[async_trait]
impl Classifier for GeminiClassifier {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn classify(
        &self,
        raw_title: &str,
        raw_body: &str,
    ) -> Result<ClassifiedSummary, LlmError> {
        let prompt = build_prompt(raw_title, raw_body);
        let summary = retry_with_backoff(
            &self.config.retry,
            "gemini_extract",
            LlmError::is_transient,
            || self.extract_once(&prompt),
        )
        .await?;

        let summary = normalize_summary(PROVIDER, summary)?;
        debug!(title = %summary.title, "Listing classified");
        Ok(summary)
    }
}
