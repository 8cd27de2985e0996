//! Ingestion pipeline.
//!
//! Each batch flows through:
//! 1. `Source::fetch_batch()`: pull the newest items
//! 2. `Store::get_item_record()`: new item, lifecycle update, or nothing
//! 3. `Classifier::classify()`: structured summary for new items
//! 4. `Matcher`: evaluate every alert rule against the summary
//! 5. `builder` + `Messenger`: feed post, reactions, subscriber ping
//! 6. `Store::save_item_record()` and `trim_old_records()`
//!
//! `Orchestrator::run_batch()` drives the whole thing.

pub mod builder;
pub mod matcher;
pub mod orchestrator;
pub mod routing_cache;
pub mod types;

pub use orchestrator::{BatchReport, Orchestrator, OrchestratorDeps};
