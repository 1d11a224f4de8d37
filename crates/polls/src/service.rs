//! Command-facing facade: turns slash commands into creator and results calls
//! and every outcome into a chat reply.

use async_trait::async_trait;
use tracing::{error, info};

use tallybot_chat::commands::{
    CommandContext, CommandReply, CommandRouteError, PollCommandService,
};
use tallybot_chat::ChatError;
use tallybot_core::config::PollsConfig;
use tallybot_core::domain::poll::ChannelId;
use tallybot_core::ApplicationError;

use crate::creator::{CreateError, CreateRequest, PollCreator};
use crate::results::{PollResults, ResultsError};

const NO_POLL_REPLY: &str = "❌ No poll found in this channel.";
const NO_ACCESS_REPLY: &str = "❌ I do not have access to that channel.";

pub struct PollService {
    creator: PollCreator,
    results: PollResults,
    config: PollsConfig,
}

impl PollService {
    pub fn new(creator: PollCreator, results: PollResults, config: PollsConfig) -> Self {
        Self { creator, results, config }
    }

    fn create_failure_reply(&self, error: CreateError, context: &CommandContext) -> CommandReply {
        match error {
            CreateError::NoCandidates { window_days, .. } => CommandReply::ephemeral(format!(
                "❌ No liked messages found from the past {window_days} days."
            )),
            CreateError::Platform(ChatError::ChannelUnavailable(_)) => {
                CommandReply::ephemeral(NO_ACCESS_REPLY)
            }
            other => {
                error!(
                    event_name = "poll.command.create_failed",
                    correlation_id = %context.request_id,
                    channel_id = %context.channel_id,
                    error = %other,
                    "poll creation failed"
                );
                failure_reply(ApplicationError::from(other), context)
            }
        }
    }
}

fn failure_reply(error: ApplicationError, context: &CommandContext) -> CommandReply {
    let interface = error.into_interface(context.request_id.clone());
    CommandReply::ephemeral(format!(
        "❌ {} (ref: {})",
        interface.user_message(),
        interface.correlation_id()
    ))
}

#[async_trait]
impl PollCommandService for PollService {
    async fn create_from_likes(
        &self,
        count: Option<usize>,
        source_channel: ChannelId,
        context: &CommandContext,
    ) -> Result<CommandReply, CommandRouteError> {
        let request = CreateRequest {
            target_channel: context.channel_id.clone(),
            source_channel,
            policy: self.config.ranking_policy(count),
            guild_id: context.guild_id.clone(),
            correlation_id: context.request_id.clone(),
        };

        match self.creator.create(request).await {
            Ok(record) => {
                info!(
                    event_name = "poll.command.created",
                    correlation_id = %context.request_id,
                    user_id = %context.user_id,
                    poll_id = %record.id,
                    "poll command completed"
                );
                let count = record.options.len();
                Ok(CommandReply::public(format!(
                    "✅ Poll started with {count} option{}. Voting closes <t:{}:R>.",
                    if count == 1 { "" } else { "s" },
                    record.expires_at.timestamp()
                )))
            }
            Err(error) => Ok(self.create_failure_reply(error, context)),
        }
    }

    async fn poll_results(
        &self,
        context: &CommandContext,
    ) -> Result<CommandReply, CommandRouteError> {
        match self.results.latest_in_channel(&context.channel_id).await {
            Ok(Some(view)) => {
                let mut content = view.content;
                if !view.live {
                    content.push_str("\n\n_Live counts are unavailable; showing the last saved tally._");
                }
                Ok(CommandReply::public(content))
            }
            Ok(None) => Ok(CommandReply::ephemeral(NO_POLL_REPLY)),
            Err(ResultsError::Store(error)) => {
                error!(
                    event_name = "poll.command.results_failed",
                    correlation_id = %context.request_id,
                    channel_id = %context.channel_id,
                    error = %error,
                    "poll results query failed"
                );
                Ok(failure_reply(ApplicationError::Persistence(error.to_string()), context))
            }
        }
    }
}
