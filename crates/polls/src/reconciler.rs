//! Reaction reconciliation: live platform reactions to per-option vote counts.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use tallybot_chat::{ChatError, ChatPlatform};
use tallybot_core::domain::poll::{ChannelId, MessageId, PollOption};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("poll message {message_id} no longer exists in channel {channel_id}")]
    NotFound { channel_id: ChannelId, message_id: MessageId },
    #[error("channel {0} cannot be reached")]
    ChannelUnavailable(ChannelId),
    #[error("platform failure while reconciling: {0}")]
    Platform(ChatError),
    #[error("reconciliation did not finish within {0:?}")]
    Timeout(Duration),
    #[error("platform rate limit hit; retry after {0:?}")]
    RateLimited(Duration),
}

impl ReconcileError {
    /// Terminal errors stop the poll; a timeout or rate limit only skips one tick.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Timeout(_) | Self::RateLimited(_))
    }
}

impl From<ChatError> for ReconcileError {
    fn from(error: ChatError) -> Self {
        match error {
            ChatError::MessageNotFound { channel_id, message_id } => {
                Self::NotFound { channel_id, message_id }
            }
            ChatError::ChannelUnavailable(channel_id) => Self::ChannelUnavailable(channel_id),
            ChatError::RateLimited { retry_after } => Self::RateLimited(retry_after),
            other => Self::Platform(other),
        }
    }
}

#[derive(Clone)]
pub struct ReactionReconciler {
    platform: Arc<dyn ChatPlatform>,
    timeout: Duration,
}

impl ReactionReconciler {
    pub fn new(platform: Arc<dyn ChatPlatform>, timeout: Duration) -> Self {
        Self { platform, timeout }
    }

    /// Counts non-bot reactors for each option, in option order.
    ///
    /// Bots are excluded by identity, so the bot's own seed reaction and any
    /// other bot's reactions never count as votes.
    pub async fn reconcile(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        options: &[PollOption],
    ) -> Result<Vec<u32>, ReconcileError> {
        tokio::time::timeout(self.timeout, self.count_votes(channel_id, message_id, options))
            .await
            .map_err(|_| ReconcileError::Timeout(self.timeout))?
    }

    async fn count_votes(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        options: &[PollOption],
    ) -> Result<Vec<u32>, ReconcileError> {
        let message = self.platform.fetch_message(channel_id, message_id).await?;

        let mut counts = Vec::with_capacity(options.len());
        for option in options {
            let reacted = message.reactions.iter().any(|reaction| reaction.emoji == option.emoji);
            if !reacted {
                counts.push(0);
                continue;
            }

            let users = self.platform.reaction_users(channel_id, message_id, &option.emoji).await?;
            let votes = users.iter().filter(|user| !user.bot).count();
            counts.push(u32::try_from(votes).unwrap_or(u32::MAX));
        }
        Ok(counts)
    }
}
