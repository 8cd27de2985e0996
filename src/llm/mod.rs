//! LLM-backed classification of raw listings.
//!
//! Supports:
//! - **Gemini**: structured extraction via rig-core
//!
//! A `Classifier` turns a raw title and body into a `ClassifiedSummary`
//! (clean title, description, price, location, condition).

pub mod gemini;

pub use gemini::{GeminiClassifier, GeminiConfig};

use async_trait::async_trait;

use crate::error::LlmError;
use crate::pipeline::types::ClassifiedSummary;

/// Extracts structured listing details from free text.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Model identifier, for logs.
    fn model_name(&self) -> &str;

    async fn classify(&self, raw_title: &str, raw_body: &str)
    -> Result<ClassifiedSummary, LlmError>;
}

/// System instruction shared by classifier backends.
pub const CLASSIFY_SYSTEM_PROMPT: &str = "\
You summarize hardware-swap listings for a deal alert feed.
Fill in these fields:
- title: a short, clean item title without location or trade tags
- description: one or two sentences on what is offered and any notable details
- price: the asking price with currency symbol, or \"\" if none
- location: city or region, or \"\" if none
- condition: e.g. BNIB, used, refurbished, or \"\" if unknown
Keep common trade abbreviations such as WTB, WTS, BNIB, OBO and MSRP as written.
Do not invent details that are not in the listing.";

/// Trim the extracted title and reject a summary without one.
pub(crate) fn normalize_summary(
    provider: &str,
    mut summary: ClassifiedSummary,
) -> Result<ClassifiedSummary, LlmError> {
    summary.title = summary.title.trim().to_string();
    if summary.title.is_empty() {
        return Err(LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "summary has an empty title".to_string(),
        });
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_title() {
        let summary = ClassifiedSummary {
            title: "  RTX 3080 ".into(),
            price: Some("$500".into()),
            ..Default::default()
        };
        let summary = normalize_summary("test", summary).unwrap();
        assert_eq!(summary.title, "RTX 3080");
        assert_eq!(summary.price.as_deref(), Some("$500"));
    }

    #[test]
    fn normalize_rejects_blank_title() {
        let summary = ClassifiedSummary {
            title: "   ".into(),
            ..Default::default()
        };
        let err = normalize_summary("test", summary).unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }
}
