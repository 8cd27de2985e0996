//! Discord REST messenger.
//!
//! Renders a `Presentation` as an embed plus a button action row and talks
//! to the v10 REST API with a bot token. Only the subset the pipeline needs
//! is covered: create, edit, react.

use async_trait::async_trait;
use reqwest::{Method, Url};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::channels::Messenger;
use crate::config::{env_optional, env_required};
use crate::error::{ChannelError, ConfigError};
use crate::pipeline::builder::{ActionControl, Presentation};
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::text::truncate;

/// Base URL for the Discord REST API v10.
const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

const CHANNEL_NAME: &str = "discord";

/// Embed title length limit.
const MAX_TITLE_CHARS: usize = 256;
/// Embed description length limit.
const MAX_DESCRIPTION_CHARS: usize = 4096;

/// Button styles from the components API.
const BUTTON_SECONDARY: u8 = 2;
const BUTTON_LINK: u8 = 5;

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub bot_token: SecretString,
    pub api_base: String,
    /// Used to build message permalinks.
    pub web_base: String,
    pub retry: RetryConfig,
}

impl DiscordConfig {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: SecretString::from(bot_token.into()),
            api_base: DISCORD_API_BASE.to_string(),
            web_base: "https://discord.com".to_string(),
            retry: RetryConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(env_required("DISCORD_BOT_TOKEN")?);
        if let Some(base) = env_optional("DISCORD_API_BASE") {
            config.api_base = base;
        }
        Ok(config)
    }
}

#[derive(Debug, serde::Deserialize)]
struct CreatedMessage {
    id: String,
}

/// Messenger that posts into Discord channels.
pub struct DiscordMessenger {
    http: reqwest::Client,
    config: DiscordConfig,
}

impl DiscordMessenger {
    pub fn new(config: DiscordConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Build an API URL from raw path segments, percent-encoding each one.
    fn api_url(&self, segments: &[&str]) -> Result<Url, ChannelError> {
        let mut url = Url::parse(&self.config.api_base)
            .map_err(|e| ChannelError::InvalidMessage(format!("bad API base URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ChannelError::InvalidMessage("API base URL cannot have a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request_once(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<String, ChannelError> {
        let mut request = self
            .http
            .request(method, url)
            .header(
                "Authorization",
                format!("Bot {}", self.config.bot_token.expose_secret()),
            );
        if let Some(body) = body {
            request = request.json(body);
        } else {
            request = request.header("Content-Length", "0");
        }

        let resp = request.send().await.map_err(|e| ChannelError::SendFailed {
            name: CHANNEL_NAME.to_string(),
            reason: e.to_string(),
        })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(ChannelError::RateLimited {
                name: CHANNEL_NAME.to_string(),
            });
        }
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ChannelError::Status {
                name: CHANNEL_NAME.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    async fn request(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<Value>,
        operation: &str,
    ) -> Result<String, ChannelError> {
        let url = self.api_url(segments)?;
        let retry_on = if method == Method::POST {
            is_rate_limited
        } else {
            is_transient
        };
        retry_with_backoff(&self.config.retry, operation, retry_on, || {
            self.request_once(method.clone(), url.clone(), body.as_ref())
        })
        .await
    }
}

/// Retry policy for idempotent calls (edits and reactions).
fn is_transient(err: &ChannelError) -> bool {
    match err {
        ChannelError::SendFailed { .. } | ChannelError::RateLimited { .. } => true,
        ChannelError::Status { status, .. } => *status >= 500,
        ChannelError::InvalidMessage(_) => false,
    }
}

/// Retry policy for message creation. A 429 is rejected before anything is
/// posted; a dropped connection or a 5xx may already have created the message.
fn is_rate_limited(err: &ChannelError) -> bool {
    matches!(err, ChannelError::RateLimited { .. })
}

// ── Rendering ───────────────────────────────────────────────────────

/// Convert a presentation into a Discord embed object.
pub fn render_embed(p: &Presentation) -> Value {
    let mut embed = Map::new();
    embed.insert("title".into(), json!(truncate(&p.title, MAX_TITLE_CHARS)));
    if !p.url.is_empty() {
        embed.insert("url".into(), json!(p.url));
    }
    if let Some(description) = &p.description {
        embed.insert(
            "description".into(),
            json!(truncate(description, MAX_DESCRIPTION_CHARS)),
        );
    }
    embed.insert("color".into(), json!(p.color));
    if !p.fields.is_empty() {
        let fields: Vec<Value> = p
            .fields
            .iter()
            .map(|f| json!({ "name": f.name, "value": f.value, "inline": f.inline }))
            .collect();
        embed.insert("fields".into(), Value::Array(fields));
    }
    if let Some(thumbnail) = &p.thumbnail {
        embed.insert("thumbnail".into(), json!({ "url": thumbnail }));
    }
    if let Some(footer) = &p.footer {
        embed.insert("footer".into(), json!({ "text": footer }));
    }
    if let Some(ts) = p.timestamp {
        embed.insert("timestamp".into(), json!(ts.to_rfc3339()));
    }
    Value::Object(embed)
}

/// Convert actions into a single action row. Empty when there are none.
pub fn render_components(actions: &[ActionControl]) -> Vec<Value> {
    if actions.is_empty() {
        return Vec::new();
    }
    let buttons: Vec<Value> = actions
        .iter()
        .map(|action| match action {
            ActionControl::OpenLink { label, url } => json!({
                "type": 2,
                "style": BUTTON_LINK,
                "label": label,
                "emoji": { "name": "🌐" },
                "url": url,
            }),
            ActionControl::Mute { label, custom_id } => json!({
                "type": 2,
                "style": BUTTON_SECONDARY,
                "label": label,
                "emoji": { "name": "🔇" },
                "custom_id": custom_id,
            }),
        })
        .collect();
    vec![json!({ "type": 1, "components": buttons })]
}

fn message_body(p: &Presentation) -> Value {
    json!({
        "embeds": [render_embed(p)],
        "components": render_components(&p.actions),
    })
}

/// Mention text for a subscriber ping.
pub fn ping_content(owner_ids: &[String], link: &str) -> String {
    let mentions: Vec<String> = owner_ids.iter().map(|id| format!("<@{id}>")).collect();
    format!(
        "{} - **Match Found in the Deal Feed!** <{link}>",
        mentions.join(" ")
    )
}

// ── Messenger ───────────────────────────────────────────────────────

#[async_trait]
impl Messenger for DiscordMessenger {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn deliver_new(
        &self,
        destination: &str,
        presentation: &Presentation,
    ) -> Result<String, ChannelError> {
        let text = self
            .request(
                Method::POST,
                &["channels", destination, "messages"],
                Some(message_body(presentation)),
                "discord_create_message",
            )
            .await?;
        let created: CreatedMessage = serde_json::from_str(&text).map_err(|e| {
            ChannelError::InvalidMessage(format!("create message response: {e}"))
        })?;
        debug!(channel = destination, message_id = %created.id, "Feed message posted");
        Ok(created.id)
    }

    async fn notify_subscribers(
        &self,
        destination: &str,
        owner_ids: &[String],
        link: &str,
    ) -> Result<(), ChannelError> {
        if owner_ids.is_empty() {
            return Ok(());
        }
        let body = json!({
            "content": ping_content(owner_ids, link),
            "allowed_mentions": { "users": owner_ids },
        });
        self.request(
            Method::POST,
            &["channels", destination, "messages"],
            Some(body),
            "discord_ping",
        )
        .await?;
        debug!(channel = destination, owners = owner_ids.len(), "Subscribers pinged");
        Ok(())
    }

    async fn edit_existing(
        &self,
        destination: &str,
        message_ref: &str,
        presentation: &Presentation,
    ) -> Result<(), ChannelError> {
        self.request(
            Method::PATCH,
            &["channels", destination, "messages", message_ref],
            Some(message_body(presentation)),
            "discord_edit_message",
        )
        .await?;
        debug!(channel = destination, message_id = message_ref, "Message edited");
        Ok(())
    }

    async fn add_reaction(
        &self,
        destination: &str,
        message_ref: &str,
        emoji: &str,
    ) -> Result<(), ChannelError> {
        self.request(
            Method::PUT,
            &[
                "channels",
                destination,
                "messages",
                message_ref,
                "reactions",
                emoji,
                "@me",
            ],
            None,
            "discord_add_reaction",
        )
        .await?;
        Ok(())
    }

    fn message_link(&self, scope_id: &str, destination: &str, message_ref: &str) -> String {
        format!(
            "{}/channels/{scope_id}/{destination}/{message_ref}",
            self.config.web_base.trim_end_matches('/')
        )
    }
}
