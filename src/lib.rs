//! swap-watch: deal alert pipeline for hardware-swap listings.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod retry;
pub mod server;
pub mod source;
pub mod store;
mod text;
