//! Shared types for the ingestion pipeline.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

// ── Source items ────────────────────────────────────────────────────

/// One externally sourced listing, as returned by a `Source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Stable external identifier. Dedupe key for records.
    pub id: String,
    pub title: String,
    /// Free-text body. Empty for link-only posts.
    pub body: String,
    /// Canonical link to the listing.
    pub url: String,
    pub score: i64,
    pub num_comments: i64,
    /// Community label, e.g. "Selling", "Sold", "Closed".
    pub flair: Option<String>,
    /// Set by the source when a moderator or author removed the item.
    pub removed_by: Option<String>,
    pub thumbnail: Option<String>,
    pub author: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl Item {
    /// Whether the item has reached a closed state.
    ///
    /// `terminal_flairs` must already be lower-case.
    pub fn is_terminal(&self, terminal_flairs: &[String]) -> bool {
        self.is_removed() || self.has_terminal_flair(terminal_flairs)
    }

    /// Human label for a closed item, shown in the edited feed post.
    pub fn status_label(&self, terminal_flairs: &[String]) -> String {
        match &self.flair {
            Some(flair) if self.has_terminal_flair(terminal_flairs) => flair.trim().to_string(),
            _ => "Removed".to_string(),
        }
    }

    /// Score plus comment count, floored at zero.
    pub fn engagement(&self) -> u64 {
        self.score.saturating_add(self.num_comments).max(0) as u64
    }

    fn is_removed(&self) -> bool {
        self.removed_by
            .as_deref()
            .is_some_and(|r| !r.trim().is_empty())
    }

    fn has_terminal_flair(&self, terminal_flairs: &[String]) -> bool {
        self.flair.as_deref().is_some_and(|flair| {
            let flair = flair.trim().to_lowercase();
            terminal_flairs.iter().any(|t| *t == flair)
        })
    }
}

// ── Classifier output ───────────────────────────────────────────────

/// Structured summary extracted from an item's raw text.
///
/// Only `title` is required. Blank strings from the classifier
/// deserialize to `None`. Field docs double as the extraction schema the
/// model is given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClassifiedSummary {
    /// Short, clean item title without location or trade tags.
    pub title: String,
    /// One or two sentences on what is offered.
    #[serde(default, deserialize_with = "blank_as_none")]
    #[schemars(with = "Option<String>")]
    pub description: Option<String>,
    /// Asking price with currency symbol.
    #[serde(default, deserialize_with = "blank_as_none")]
    #[schemars(with = "Option<String>")]
    pub price: Option<String>,
    /// City or region.
    #[serde(default, deserialize_with = "blank_as_none")]
    #[schemars(with = "Option<String>")]
    pub location: Option<String>,
    /// e.g. BNIB, used, refurbished.
    #[serde(default, deserialize_with = "blank_as_none")]
    #[schemars(with = "Option<String>")]
    pub condition: Option<String>,
}

impl ClassifiedSummary {
    /// Lower-cased text that alert rules are evaluated against.
    pub fn corpus(&self) -> String {
        let mut corpus = self.title.clone();
        for part in [&self.description, &self.location] {
            corpus.push(' ');
            if let Some(text) = part {
                corpus.push_str(text);
            }
        }
        corpus.to_lowercase()
    }
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

// ── Rules ───────────────────────────────────────────────────────────

/// A subscriber's keyword rule, scoped to one community server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub owner_id: String,
    pub scope_id: String,
    /// Every term must be present.
    pub must_have: Vec<String>,
    /// At least one term must be present, when non-empty.
    pub any_of: Vec<String>,
    /// No term may be present.
    pub must_not: Vec<String>,
    /// The query as the user typed it.
    pub raw_query: String,
    pub created_at: DateTime<Utc>,
}

impl AlertRule {
    pub fn new(
        owner_id: impl Into<String>,
        scope_id: impl Into<String>,
        must_have: &[&str],
        any_of: &[&str],
        must_not: &[&str],
    ) -> Self {
        let to_vec = |terms: &[&str]| terms.iter().map(|t| t.to_string()).collect::<Vec<_>>();
        let must_have = to_vec(must_have);
        let any_of = to_vec(any_of);
        let must_not = to_vec(must_not);
        let raw_query = describe_query(&must_have, &any_of, &must_not);
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            scope_id: scope_id.into(),
            must_have,
            any_of,
            must_not,
            raw_query,
            created_at: Utc::now(),
        }
    }
}

fn describe_query(must_have: &[String], any_of: &[String], must_not: &[String]) -> String {
    let mut parts: Vec<String> = must_have.to_vec();
    if !any_of.is_empty() {
        parts.push(format!("({})", any_of.join(" OR ")));
    }
    parts.extend(must_not.iter().map(|t| format!("-{t}")));
    parts.join(" ")
}

/// Subscribers per scope for one item: `scope_id -> owner_ids`.
pub type ScopeMatches = BTreeMap<String, BTreeSet<String>>;

// ── Persistence ─────────────────────────────────────────────────────

/// Durable proof that an item was delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub external_id: String,
    /// Classifier title at first delivery. Used for the closed edit.
    pub cleaned_title: String,
    /// `scope_id -> message_ref` of each feed post.
    pub deliveries: BTreeMap<String, String>,
    pub first_recorded_at: DateTime<Utc>,
}

/// Where a scope's feed posts and subscriber pings go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub scope_id: String,
    pub feed_destination: String,
    pub ping_destination: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(flair: Option<&str>, removed_by: Option<&str>) -> Item {
        Item {
            id: "abc".into(),
            title: "[H] RTX 3080 [W] Cash".into(),
            body: String::new(),
            url: "https://example.com/abc".into(),
            score: 4,
            num_comments: 2,
            flair: flair.map(String::from),
            removed_by: removed_by.map(String::from),
            thumbnail: None,
            author: "seller".into(),
            created_at: None,
        }
    }

    fn terminal() -> Vec<String> {
        vec!["sold".into(), "closed".into()]
    }

    #[test]
    fn flair_is_terminal_case_insensitively() {
        assert!(item(Some("SOLD"), None).is_terminal(&terminal()));
        assert!(item(Some(" Closed "), None).is_terminal(&terminal()));
        assert!(!item(Some("Selling"), None).is_terminal(&terminal()));
        assert!(!item(None, None).is_terminal(&terminal()));
    }

    #[test]
    fn removal_is_terminal() {
        let removed = item(Some("Selling"), Some("moderator"));
        assert!(removed.is_terminal(&terminal()));
        assert_eq!(removed.status_label(&terminal()), "Removed");
        assert!(!item(None, Some("  ")).is_terminal(&terminal()));
    }

    #[test]
    fn status_label_prefers_flair() {
        assert_eq!(item(Some("Sold"), None).status_label(&terminal()), "Sold");
    }

    #[test]
    fn engagement_sums_before_flooring() {
        let mut it = item(None, None);
        it.score = -5;
        it.num_comments = 3;
        assert_eq!(it.engagement(), 0);
        it.score = -10;
        it.num_comments = 12;
        assert_eq!(it.engagement(), 2);
    }

    #[test]
    fn summary_blank_fields_become_none() {
        let summary: ClassifiedSummary = serde_json::from_str(
            r#"{"title":"RTX 3080","description":"","price":"  ","location":"Toronto"}"#,
        )
        .unwrap();
        assert_eq!(summary.description, None);
        assert_eq!(summary.price, None);
        assert_eq!(summary.condition, None);
        assert_eq!(summary.location.as_deref(), Some("Toronto"));
    }

    #[test]
    fn corpus_joins_title_description_location() {
        let summary = ClassifiedSummary {
            title: "RTX 3080ti".into(),
            description: Some("BNIB".into()),
            location: Some("Toronto".into()),
            ..Default::default()
        };
        assert_eq!(summary.corpus(), "rtx 3080ti bnib toronto");
    }

    #[test]
    fn rule_raw_query_is_readable() {
        let rule = AlertRule::new("u1", "s1", &["3080"], &["toronto", "ottawa"], &["broken"]);
        assert_eq!(rule.raw_query, "3080 (toronto OR ottawa) -broken");
    }
}
