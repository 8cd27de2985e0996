//! Messenger abstraction for outbound delivery.

pub mod discord;

pub use discord::{DiscordConfig, DiscordMessenger};

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::pipeline::builder::Presentation;

/// Outbound side of the pipeline: feed posts, pings, and edits.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Post a presentation to a feed destination. Returns the message ref
    /// later used for edits.
    async fn deliver_new(
        &self,
        destination: &str,
        presentation: &Presentation,
    ) -> Result<String, ChannelError>;

    /// Send one consolidated mention of every owner, linking to the feed post.
    async fn notify_subscribers(
        &self,
        destination: &str,
        owner_ids: &[String],
        link: &str,
    ) -> Result<(), ChannelError>;

    /// Replace a previously delivered message.
    async fn edit_existing(
        &self,
        destination: &str,
        message_ref: &str,
        presentation: &Presentation,
    ) -> Result<(), ChannelError>;

    /// React to a delivered message. Messengers without reactions ignore it.
    async fn add_reaction(
        &self,
        _destination: &str,
        _message_ref: &str,
        _emoji: &str,
    ) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Link a reader can follow to a delivered message.
    fn message_link(&self, _scope_id: &str, _destination: &str, message_ref: &str) -> String {
        message_ref.to_string()
    }
}
