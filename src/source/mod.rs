//! Item sources: where batches come from.

pub mod reddit;

pub use reddit::{RedditConfig, RedditSource};

use async_trait::async_trait;

use crate::error::SourceError;
use crate::pipeline::types::Item;

/// A feed of externally published items.
#[async_trait]
pub trait Source: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Pull the current batch, newest first. Order carries no meaning to
    /// the pipeline.
    async fn fetch_batch(&self) -> Result<Vec<Item>, SourceError>;
}
