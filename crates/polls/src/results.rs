//! Read-only view of the latest poll in a channel.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use tallybot_chat::ChatPlatform;
use tallybot_core::domain::poll::{ChannelId, PollRecord, PollStatus};
use tallybot_core::{render, RenderLimits, RenderMode};
use tallybot_db::{PollStore, StoreError};

use crate::reconciler::ReactionReconciler;

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("poll store failure: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultsView {
    pub record: PollRecord,
    pub mode: RenderMode,
    pub content: String,
    /// False when live counts could not be read and stored counts were shown.
    pub live: bool,
}

pub struct PollResults {
    store: Arc<dyn PollStore>,
    platform: Arc<dyn ChatPlatform>,
    reconciler: ReactionReconciler,
    render_limits: RenderLimits,
}

impl PollResults {
    pub fn new(
        store: Arc<dyn PollStore>,
        platform: Arc<dyn ChatPlatform>,
        reconciler: ReactionReconciler,
        render_limits: RenderLimits,
    ) -> Self {
        Self { store, platform, reconciler, render_limits }
    }

    fn render_limits(&self) -> RenderLimits {
        let mut limits = self.render_limits;
        limits.message_char_limit =
            limits.message_char_limit.min(self.platform.message_char_limit());
        limits
    }

    /// The poll in `channel_id` with the greatest expiry, rendered.
    ///
    /// Active polls are reconciled against live reactions but nothing is
    /// written back; only the scheduler mutates stored counts.
    pub async fn latest_in_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Option<ResultsView>, ResultsError> {
        let polls = self.store.load().await?;
        let Some(mut record) = polls
            .into_values()
            .filter(|record| &record.channel_id == channel_id)
            .max_by_key(|record| record.expires_at)
        else {
            debug!(event_name = "poll.results.none", channel_id = %channel_id, "no poll in channel");
            return Ok(None);
        };

        if record.status == PollStatus::Finalized {
            let content = render(&record.options, RenderMode::Final, self.render_limits());
            return Ok(Some(ResultsView { record, mode: RenderMode::Final, content, live: false }));
        }

        let message_id = record.id.message_id();
        let live = match self.reconciler.reconcile(channel_id, &message_id, &record.options).await {
            Ok(counts) => {
                for (option, votes) in record.options.iter_mut().zip(counts) {
                    option.votes = votes;
                }
                true
            }
            Err(error) => {
                warn!(
                    event_name = "poll.results.reconcile_failed",
                    poll_id = %record.id,
                    channel_id = %channel_id,
                    error = %error,
                    "showing stored counts"
                );
                false
            }
        };

        let content = render(&record.options, RenderMode::Live, self.render_limits());
        Ok(Some(ResultsView { record, mode: RenderMode::Live, content, live }))
    }
}
