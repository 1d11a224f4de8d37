use std::sync::Arc;

use tracing::{debug, info, warn};

use tallybot_chat::ChatPlatform;
use tallybot_core::Clock;
use tallybot_db::PollStore;

use crate::scheduler::{PollScheduler, TickOutcome};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Active polls re-armed with a fresh job.
    pub resumed: usize,
    /// Past-expiry polls closed during recovery.
    pub finalized: usize,
    /// Active polls left unscheduled because their message could not be reached.
    pub skipped: usize,
}

/// Restores the lifecycle of every stored poll after a restart.
pub struct RecoveryCoordinator {
    store: Arc<dyn PollStore>,
    platform: Arc<dyn ChatPlatform>,
    scheduler: Arc<PollScheduler>,
    clock: Arc<dyn Clock>,
}

impl RecoveryCoordinator {
    pub fn new(
        store: Arc<dyn PollStore>,
        platform: Arc<dyn ChatPlatform>,
        scheduler: Arc<PollScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, platform, scheduler, clock }
    }

    /// Finalizes expired Active polls in place and re-arms the rest.
    /// Finalized records are left alone.
    pub async fn run(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let polls = match self.store.load().await {
            Ok(polls) => polls,
            Err(error) => {
                warn!(
                    event_name = "poll.recovery.store_failed",
                    error = %error,
                    "poll store could not be loaded; nothing recovered"
                );
                return report;
            }
        };

        let now = self.clock.now();
        for record in polls.into_values().filter(|record| record.is_active()) {
            if record.is_expired_at(now) {
                match self.scheduler.finalize(record).await {
                    TickOutcome::Finalized => report.finalized += 1,
                    _ => report.skipped += 1,
                }
                continue;
            }

            let message_id = record.id.message_id();
            match self.platform.fetch_message(&record.channel_id, &message_id).await {
                Ok(_) => {}
                // Rate limited: the job's own ticks will retry.
                Err(error) if error.is_transient() => {
                    debug!(
                        event_name = "poll.recovery.check_deferred",
                        poll_id = %record.id,
                        error = %error,
                        "reachability check rate limited; scheduling anyway"
                    );
                }
                Err(error) => {
                    warn!(
                        event_name = "poll.recovery.skipped",
                        poll_id = %record.id,
                        channel_id = %record.channel_id,
                        error = %error,
                        "poll message unreachable; leaving poll unscheduled"
                    );
                    report.skipped += 1;
                    continue;
                }
            }

            if self.scheduler.register(&record) {
                report.resumed += 1;
            }
        }

        info!(
            event_name = "poll.recovery.completed",
            resumed = report.resumed,
            finalized = report.finalized,
            skipped = report.skipped,
            "poll recovery completed"
        );
        report
    }
}

#[cfg(test)]
mod tests {

    use chrono::Duration;

    use tallybot_core::domain::poll::{ChannelId, PollStatus};
    use tallybot_core::RenderMode;
    use tallybot_db::PollStore;

    use super::{RecoveryCoordinator, RecoveryReport};
    use crate::testing::{Harness, CHANNEL};

    fn coordinator(harness: &Harness) -> RecoveryCoordinator {
        RecoveryCoordinator::new(
            harness.store.clone(),
            harness.platform.clone(),
            harness.scheduler.clone(),
            harness.clock.clone(),
        )
    }

    #[tokio::test]
    async fn resumes_live_polls_and_finalizes_expired_ones() {
        let harness = Harness::new();
        let expired = harness.seed_poll(&["Old A", "Old B"]).await;
        harness.vote(&expired, "🇧", &["U1"]);
        harness.clock.advance(Duration::hours(12));
        let live = harness.seed_poll(&["New A", "New B"]).await;
        harness.clock.advance(Duration::hours(13));

        let report = coordinator(&harness).run().await;

        assert_eq!(report, RecoveryReport { resumed: 1, finalized: 1, skipped: 0 });
        let closed = harness.stored(&expired.id).await;
        assert_eq!(closed.status, PollStatus::Finalized);
        assert_eq!(closed.vote_counts(), vec![0, 1]);
        assert!(harness.last_edit(&expired).starts_with(RenderMode::Final.header()));
        assert!(!harness.scheduler.is_scheduled(&expired.id));
        assert!(harness.scheduler.is_scheduled(&live.id));
        harness.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_polls_stay_active_but_unscheduled() {
        let harness = Harness::new();
        let record = harness.seed_poll(&["Alpha"]).await;
        harness.platform.set_channel_unavailable(&ChannelId(CHANNEL.to_owned()), true);

        let report = coordinator(&harness).run().await;

        assert_eq!(report, RecoveryReport { resumed: 0, finalized: 0, skipped: 1 });
        assert_eq!(harness.stored(&record.id).await.status, PollStatus::Active);
        assert!(!harness.scheduler.is_scheduled(&record.id));
    }

    #[tokio::test]
    async fn finalized_polls_are_left_alone() {
        let harness = Harness::new();
        let mut record = harness.seed_poll(&["Alpha"]).await;
        record.finalize().expect("finalize");
        harness.store.upsert(record.clone()).await.expect("store finalized");
        let writes = harness.store.write_count();

        let report = coordinator(&harness).run().await;

        assert_eq!(report, RecoveryReport::default());
        assert_eq!(harness.store.write_count(), writes);
        assert!(harness.platform.edits_of(&record.id.message_id()).is_empty());
    }

    #[tokio::test]
    async fn rerun_after_recovery_does_not_double_register() {
        let harness = Harness::new();
        harness.seed_poll(&["Alpha"]).await;

        let first = coordinator(&harness).run().await;
        let second = coordinator(&harness).run().await;

        assert_eq!(first.resumed, 1);
        assert_eq!(second.resumed, 0);
        assert_eq!(harness.scheduler.scheduled_count(), 1);
        harness.scheduler.shutdown().await;
    }
}
