//! Poll creation from the most liked recent messages of a channel.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use tallybot_chat::{jump_link, ChatError, ChatPlatform};
use tallybot_core::config::PollsConfig;
use tallybot_core::domain::poll::{ChannelId, PollId, PollOption, PollRecord};
use tallybot_core::ranking::{option_emoji, summarize_label, Candidate, RankingPolicy};
use tallybot_core::render::clamp_to_limit;
use tallybot_core::{render, ApplicationError, Clock, DomainError, RenderLimits, RenderMode};
use tallybot_db::{PollStore, StoreError};

use crate::scheduler::PollScheduler;

#[derive(Debug, Error)]
pub enum CreateError {
    #[error("no reacted messages from the last {window_days} days in channel {channel_id}")]
    NoCandidates { channel_id: ChannelId, window_days: i64 },
    #[error("chat platform failure: {0}")]
    Platform(#[from] ChatError),
    #[error("poll store failure: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl From<CreateError> for ApplicationError {
    fn from(error: CreateError) -> Self {
        match error {
            CreateError::NoCandidates { .. } => Self::NoCandidates(error.to_string()),
            CreateError::Platform(error) => Self::Integration(error.to_string()),
            CreateError::Store(error) => Self::Persistence(error.to_string()),
            CreateError::Domain(error) => Self::Domain(error),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatorSettings {
    pub fetch_limit: usize,
    pub label_word_budget: usize,
    pub poll_duration: chrono::Duration,
    pub render_limits: RenderLimits,
    /// Used for jump links in option previews.
    pub guild_id: Option<String>,
}

impl CreatorSettings {
    pub fn from_config(config: &PollsConfig, guild_id: Option<String>) -> Self {
        Self {
            fetch_limit: config.source_fetch_limit,
            label_word_budget: config.label_word_budget,
            poll_duration: config.poll_duration(),
            render_limits: config.render_limits(),
            guild_id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CreateRequest {
    /// Where the previews and the poll message are posted.
    pub target_channel: ChannelId,
    /// Where candidate messages are read from.
    pub source_channel: ChannelId,
    pub policy: RankingPolicy,
    /// Guild of the invoking channel; falls back to the configured guild.
    pub guild_id: Option<String>,
    pub correlation_id: String,
}

pub struct PollCreator {
    platform: Arc<dyn ChatPlatform>,
    store: Arc<dyn PollStore>,
    scheduler: Arc<PollScheduler>,
    clock: Arc<dyn Clock>,
    settings: CreatorSettings,
}

struct Preview {
    option: PollOption,
    content: String,
}

impl PollCreator {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        store: Arc<dyn PollStore>,
        scheduler: Arc<PollScheduler>,
        clock: Arc<dyn Clock>,
        settings: CreatorSettings,
    ) -> Self {
        Self { platform, store, scheduler, clock, settings }
    }

    fn render_limits(&self) -> RenderLimits {
        let mut limits = self.settings.render_limits;
        limits.message_char_limit =
            limits.message_char_limit.min(self.platform.message_char_limit());
        limits
    }

    pub async fn create(&self, request: CreateRequest) -> Result<PollRecord, CreateError> {
        let now = self.clock.now();
        let recent =
            self.platform.recent_messages(&request.source_channel, self.settings.fetch_limit).await?;
        let candidates = recent.into_iter().map(|message| Candidate {
            reaction_counts: message.reaction_counts(),
            source_ref: message.id,
            content: message.content,
            created_at: message.created_at,
        });

        let ranked = request.policy.rank(candidates, now);
        if ranked.is_empty() {
            return Err(CreateError::NoCandidates {
                channel_id: request.source_channel,
                window_days: request.policy.window.num_days(),
            });
        }

        let previews: Vec<Preview> = ranked
            .iter()
            .enumerate()
            .filter_map(|(index, candidate)| {
                let emoji = option_emoji(index)?;
                let (label, truncated) =
                    summarize_label(&candidate.content, self.settings.label_word_budget);
                let mut content = format!("{emoji} ({} likes)\n{label}", candidate.score);
                if truncated {
                    content.push_str("\nView full message: ");
                    content.push_str(&jump_link(
                        request.guild_id.as_deref().or(self.settings.guild_id.as_deref()),
                        &request.source_channel,
                        &candidate.source_ref,
                    ));
                }
                Some(Preview {
                    option: PollOption {
                        emoji: emoji.to_owned(),
                        label,
                        source_ref: candidate.source_ref.0.clone(),
                        votes: 0,
                    },
                    content,
                })
            })
            .collect();

        let limits = self.render_limits();
        for preview in &previews {
            let content = clamp_to_limit(preview.content.clone(), limits.message_char_limit);
            self.platform.send_message(&request.target_channel, &content).await?;
        }

        let options: Vec<PollOption> = previews.into_iter().map(|preview| preview.option).collect();
        let content = render(&options, RenderMode::Live, limits);
        let message = self.platform.send_message(&request.target_channel, &content).await?;

        for option in &options {
            if let Err(error) = self
                .platform
                .add_reaction(&request.target_channel, &message.id, &option.emoji)
                .await
            {
                warn!(
                    event_name = "poll.creator.react_failed",
                    correlation_id = %request.correlation_id,
                    poll_id = %message.id,
                    emoji = %option.emoji,
                    error = %error,
                    "could not seed option reaction"
                );
            }
        }

        let record = PollRecord::new(
            PollId::from(message.id),
            request.target_channel,
            now,
            now + self.settings.poll_duration,
            options,
        )?;
        if let Err(store_error) = self.store.upsert(record.clone()).await {
            self.abandon(&record, &request.correlation_id, &store_error).await;
            return Err(store_error.into());
        }
        self.scheduler.register(&record);

        info!(
            event_name = "poll.creator.created",
            correlation_id = %request.correlation_id,
            poll_id = %record.id,
            channel_id = %record.channel_id,
            source_channel_id = %request.source_channel,
            option_count = record.options.len(),
            expires_at = %record.expires_at,
            "poll created"
        );
        Ok(record)
    }

    /// The poll message is already live but nothing will ever tally it, so
    /// say so on the message itself.
    async fn abandon(&self, record: &PollRecord, correlation_id: &str, cause: &StoreError) {
        error!(
            event_name = "poll.creator.persist_failed",
            correlation_id = %correlation_id,
            poll_id = %record.id,
            channel_id = %record.channel_id,
            error = %cause,
            "poll posted but could not be stored"
        );
        let message_id = record.id.message_id();
        if let Err(edit_error) = self
            .platform
            .edit_message(&record.channel_id, &message_id, ABANDONED_POLL_NOTICE)
            .await
        {
            warn!(
                event_name = "poll.creator.abandon_edit_failed",
                correlation_id = %correlation_id,
                poll_id = %record.id,
                error = %edit_error,
                "could not mark unstored poll as not started"
            );
        }
    }
}

const ABANDONED_POLL_NOTICE: &str =
    "This poll could not be started and will not count votes. Please try again.";
