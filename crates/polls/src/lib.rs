//! Poll lifecycle - creation, live reconciliation, finalization, recovery
//!
//! - **Reconciler** (`reconciler`) - platform reactions to per-option counts
//! - **Scheduler** (`scheduler`) - one cancellable tick job per Active poll
//! - **Recovery** (`recovery`) - re-arms or finalizes stored polls at start-up
//! - **Creator** (`creator`) - builds a poll from the most liked recent messages
//! - **Results** (`results`) - read-only view of the latest poll in a channel
//! - **Service** (`service`) - command-facing facade used by the chat gateway

pub mod creator;
pub mod reconciler;
pub mod recovery;
pub mod results;
pub mod scheduler;
pub mod service;

pub use creator::{CreateError, CreateRequest, CreatorSettings, PollCreator};
pub use reconciler::{ReactionReconciler, ReconcileError};
pub use recovery::{RecoveryCoordinator, RecoveryReport};
pub use results::{PollResults, ResultsError, ResultsView};
pub use scheduler::{JobState, PollScheduler, SchedulerSettings, TickOutcome};
pub use service::PollService;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use tallybot_chat::{ChatPlatform, ChatUser, InMemoryChatPlatform};
    use tallybot_core::domain::poll::{ChannelId, PollId, PollOption, PollRecord};
    use tallybot_core::ranking::option_emoji;
    use tallybot_core::{render, Clock, ManualClock, RenderMode};
    use tallybot_db::{InMemoryPollStore, PollStore};

    use crate::scheduler::{PollScheduler, SchedulerSettings};

    pub const CHANNEL: &str = "100";

    pub fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).single().expect("timestamp")
    }

    pub struct Harness {
        pub store: Arc<InMemoryPollStore>,
        pub platform: Arc<InMemoryChatPlatform>,
        pub clock: Arc<ManualClock>,
        pub scheduler: Arc<PollScheduler>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_char_limit(2_000)
        }

        pub fn with_char_limit(limit: usize) -> Self {
            let store = Arc::new(InMemoryPollStore::default());
            let platform = Arc::new(InMemoryChatPlatform::default().with_message_char_limit(limit));
            platform.add_channel(&ChannelId(CHANNEL.to_owned()));
            let clock = Arc::new(ManualClock::new(start()));
            let scheduler = Arc::new(PollScheduler::new(
                store.clone(),
                platform.clone(),
                clock.clone(),
                SchedulerSettings::default(),
            ));
            Self { store, platform, clock, scheduler }
        }

        /// Posts a zeroed poll message with seed reactions and stores its record.
        pub async fn seed_poll(&self, labels: &[&str]) -> PollRecord {
            let channel = ChannelId(CHANNEL.to_owned());
            let options: Vec<PollOption> = labels
                .iter()
                .enumerate()
                .map(|(index, label)| PollOption {
                    emoji: option_emoji(index).expect("emoji").to_owned(),
                    label: (*label).to_owned(),
                    source_ref: format!("src-{index}"),
                    votes: 0,
                })
                .collect();

            let mut limits = self.scheduler.settings().render_limits;
            limits.message_char_limit = self.platform.message_char_limit();
            let content = render(&options, RenderMode::Live, limits);
            let message = self.platform.send_message(&channel, &content).await.expect("send poll");
            for option in &options {
                self.platform
                    .add_reaction(&channel, &message.id, &option.emoji)
                    .await
                    .expect("seed reaction");
            }

            let now = self.clock.now();
            let record = PollRecord::new(
                PollId::from(message.id),
                channel,
                now,
                now + Duration::hours(24),
                options,
            )
            .expect("valid poll");
            self.store.upsert(record.clone()).await.expect("store poll");
            record
        }

        /// Sets the reactors of `emoji` to the bot plus the given humans.
        pub fn vote(&self, record: &PollRecord, emoji: &str, users: &[&str]) {
            let mut reactors = vec![self.platform.bot_user().clone()];
            reactors.extend(users.iter().map(|user| ChatUser::human(*user)));
            self.platform.set_reactors(&record.id.message_id(), emoji, reactors);
        }

        pub async fn stored(&self, id: &PollId) -> PollRecord {
            self.store.get(id).await.expect("store read").expect("poll stored")
        }

        pub fn last_edit(&self, record: &PollRecord) -> String {
            self.platform.edits_of(&record.id.message_id()).pop().expect("at least one edit")
        }
    }
}
