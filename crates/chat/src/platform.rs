use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use tallybot_core::domain::poll::{ChannelId, MessageId};

/// Hard ceiling on message length enforced by Discord.
pub const DEFAULT_MESSAGE_CHAR_LIMIT: usize = 2_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatUser {
    pub id: String,
    pub bot: bool,
}

impl ChatUser {
    pub fn human(id: impl Into<String>) -> Self {
        Self { id: id.into(), bot: false }
    }

    pub fn bot(id: impl Into<String>) -> Self {
        Self { id: id.into(), bot: true }
    }
}

/// Aggregate count for one emoji on a message, as reported by the platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: ChatUser,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub reactions: Vec<ReactionSummary>,
}

/// Link that opens a message in a client. Without a guild the DM form is used.
pub fn jump_link(guild_id: Option<&str>, channel_id: &ChannelId, message_id: &MessageId) -> String {
    format!("https://discord.com/channels/{}/{channel_id}/{message_id}", guild_id.unwrap_or("@me"))
}

impl ChatMessage {
    pub fn jump_link(&self, guild_id: Option<&str>) -> String {
        jump_link(guild_id, &self.channel_id, &self.id)
    }

    pub fn reaction_counts(&self) -> Vec<(String, u32)> {
        self.reactions.iter().map(|reaction| (reaction.emoji.clone(), reaction.count)).collect()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("message {message_id} not found in channel {channel_id}")]
    MessageNotFound { channel_id: ChannelId, message_id: MessageId },
    #[error("channel {0} is unavailable")]
    ChannelUnavailable(ChannelId),
    #[error("chat request failed: {0}")]
    Request(String),
    #[error("chat api rejected request with status {status}: {detail}")]
    Api { status: u16, detail: String },
    #[error("chat response could not be decoded: {0}")]
    Decode(String),
    #[error("chat api rate limit hit; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
}

impl ChatError {
    /// The poll message or its channel is gone for good.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::MessageNotFound { .. } | Self::ChannelUnavailable(_))
    }

    /// The request may succeed unchanged once the platform lets it through.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// The operations the poll lifecycle needs from a chat platform.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    fn message_char_limit(&self) -> usize {
        DEFAULT_MESSAGE_CHAR_LIMIT
    }

    async fn send_message(
        &self,
        channel_id: &ChannelId,
        content: &str,
    ) -> Result<ChatMessage, ChatError>;

    async fn edit_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<(), ChatError>;

    async fn fetch_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<ChatMessage, ChatError>;

    /// Every user who reacted with `emoji`, bots included.
    async fn reaction_users(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<Vec<ChatUser>, ChatError>;

    async fn add_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), ChatError>;

    /// Up to `limit` most recent messages, newest first.
    async fn recent_messages(
        &self,
        channel_id: &ChannelId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChatError>;
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use tallybot_core::domain::poll::{ChannelId, MessageId};

    use super::{ChatError, ChatMessage, ChatUser};

    #[test]
    fn jump_link_uses_guild_when_known() {
        let message = ChatMessage {
            id: MessageId("300".to_owned()),
            channel_id: ChannelId("200".to_owned()),
            author: ChatUser::human("U1"),
            content: String::new(),
            created_at: Utc::now(),
            reactions: Vec::new(),
        };

        assert_eq!(message.jump_link(Some("100")), "https://discord.com/channels/100/200/300");
        assert_eq!(message.jump_link(None), "https://discord.com/channels/@me/200/300");
    }

    #[test]
    fn gone_errors_are_classified() {
        assert!(ChatError::ChannelUnavailable(ChannelId("C".to_owned())).is_gone());
        assert!(ChatError::MessageNotFound {
            channel_id: ChannelId("C".to_owned()),
            message_id: MessageId("M".to_owned()),
        }
        .is_gone());
        assert!(!ChatError::Request("timeout".to_owned()).is_gone());
        assert!(!ChatError::Api { status: 500, detail: "oops".to_owned() }.is_gone());
    }

    #[test]
    fn only_rate_limits_are_transient() {
        let limited = ChatError::RateLimited { retry_after: std::time::Duration::from_secs(1) };
        assert!(limited.is_transient());
        assert!(!limited.is_gone());
        assert!(!ChatError::Api { status: 500, detail: "oops".to_owned() }.is_transient());
        assert!(!ChatError::ChannelUnavailable(ChannelId("C".to_owned())).is_transient());
    }
}
