//! Presentation building for feed posts.
//!
//! Pure functions that turn an item and its classified summary into a
//! messenger-agnostic `Presentation`. Messengers render it into their own
//! wire format (Discord embeds, for instance).

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pipeline::types::{ClassifiedSummary, Item};

/// Custom id carried by the mute control. Interaction handlers key on it.
pub const MUTE_CUSTOM_ID: &str = "mute_item";

/// Color used for closed-item edits.
pub const CLOSED_COLOR: u32 = 0x2C2F33;

/// Thumbnail values Reddit uses as placeholders instead of a URL.
const PLACEHOLDER_THUMBNAILS: &[&str] = &["self", "default", "nsfw", "spoiler", "image"];

/// A rich message ready to be rendered by a messenger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Presentation {
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub color: u32,
    pub fields: Vec<PresentationField>,
    pub thumbnail: Option<String>,
    pub footer: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub actions: Vec<ActionControl>,
}

/// A labelled value shown alongside the description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresentationField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Interactive controls attached below a presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionControl {
    /// Plain link out to the listing.
    OpenLink { label: String, url: String },
    /// Lets a reader silence further pings for this item.
    Mute { label: String, custom_id: String },
}

/// Engagement bands mapped to a highlight color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorTier {
    Hot,
    Warm,
    Mild,
    Cold,
}

impl ColorTier {
    /// Tier for a combined score + comment count.
    pub fn from_engagement(engagement: u64) -> Self {
        match engagement {
            16.. => Self::Hot,
            6..=15 => Self::Warm,
            3..=5 => Self::Mild,
            _ => Self::Cold,
        }
    }

    pub fn color(self) -> u32 {
        match self {
            Self::Hot => 0xFF0000,
            Self::Warm => 0xFFA500,
            Self::Mild => 0xFFFF00,
            Self::Cold => 0x808080,
        }
    }
}

/// Build the feed post for a newly seen item.
pub fn build_new_item_presentation(item: &Item, summary: &ClassifiedSummary) -> Presentation {
    let mut fields = Vec::new();
    for (name, value) in [
        ("💰 Price", &summary.price),
        ("✨ Condition", &summary.condition),
        ("📍 Location", &summary.location),
    ] {
        if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
            fields.push(PresentationField {
                name: name.to_string(),
                value: value.to_string(),
                inline: true,
            });
        }
    }

    Presentation {
        title: format!("📦 {}", summary.title),
        url: item.url.clone(),
        description: summary.description.clone(),
        color: ColorTier::from_engagement(item.engagement()).color(),
        fields,
        thumbnail: usable_thumbnail(item.thumbnail.as_deref()),
        footer: Some(format!("👍 {} | 💬 {}", item.score, item.num_comments)),
        timestamp: item.created_at,
        actions: vec![
            ActionControl::OpenLink {
                label: "Open Listing".to_string(),
                url: item.url.clone(),
            },
            ActionControl::Mute {
                label: "Mute Item".to_string(),
                custom_id: MUTE_CUSTOM_ID.to_string(),
            },
        ],
    }
}

/// Build the replacement shown once an item is sold, closed, or removed.
pub fn build_closed_presentation(
    last_known_title: &str,
    item_link: &str,
    status_label: &str,
) -> Presentation {
    Presentation {
        title: format!("~~{last_known_title}~~"),
        url: item_link.to_string(),
        description: Some(format!("This deal has been marked as **{status_label}**.")),
        color: CLOSED_COLOR,
        fields: Vec::new(),
        thumbnail: None,
        footer: Some("Deal Closed".to_string()),
        timestamp: None,
        actions: Vec::new(),
    }
}

fn usable_thumbnail(thumbnail: Option<&str>) -> Option<String> {
    let thumb = thumbnail?.trim();
    if PLACEHOLDER_THUMBNAILS.contains(&thumb) {
        return None;
    }
    (thumb.starts_with("https://") || thumb.starts_with("http://")).then(|| thumb.to_string())
}
