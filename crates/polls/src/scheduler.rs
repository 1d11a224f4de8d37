//! Per-poll reconciliation jobs.
//!
//! Each Active poll owns one tokio task that ticks on a fixed period. A tick
//! reconciles reactions, edits the poll message, and only then persists the
//! new counts, so the store never runs ahead of what users can see. Once the
//! poll expires the tick finalizes it instead. Any terminal failure stops the
//! job for good (fail-stop); the record is left as it was.
//!
//! ```text
//! Active ──tick──▶ Active
//!   │ expired            │ NotFound / ChannelUnavailable / Platform / edit failed
//!   │                    │ (timeouts and rate limits only skip the tick)
//!   ▼                    ▼
//! Finalizing ──▶ Finalized      Aborted
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tallybot_chat::ChatPlatform;
use tallybot_core::config::PollsConfig;
use tallybot_core::domain::poll::{PollId, PollRecord};
use tallybot_core::{render, Clock, RenderLimits, RenderMode};
use tallybot_db::PollStore;

use crate::reconciler::{ReactionReconciler, ReconcileError};

/// How many stopped polls keep their terminal state visible to `state()`.
const RETIRED_STATE_LIMIT: usize = 1_024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub reconcile_timeout: Duration,
    pub history_limit: usize,
    pub render_limits: RenderLimits,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&PollsConfig::default())
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &PollsConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            reconcile_timeout: config.reconcile_timeout(),
            history_limit: config.history_limit,
            render_limits: config.render_limits(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Active,
    Finalizing,
    Finalized,
    Aborted,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Finalizing => "finalizing",
            Self::Finalized => "finalized",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Counts reconciled and the message edited. `changed` reports whether
    /// the stored counts moved.
    Applied { changed: bool },
    Finalized,
    Aborted,
    /// Another tick for the same poll was still running.
    Skipped,
    TimedOut,
    /// The platform asked us to slow down; the next tick tries again.
    RateLimited,
    /// The message was edited but the store write failed; the poll stays Active.
    StoreFailed,
    NotScheduled,
}

impl TickOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Aborted)
    }
}

struct JobEntry {
    state: JobState,
    token: CancellationToken,
    in_flight: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

/// Terminal states of stopped jobs, oldest evicted first once `limit` is hit.
struct RetiredStates {
    limit: usize,
    order: VecDeque<PollId>,
    states: HashMap<PollId, JobState>,
}

impl RetiredStates {
    fn new(limit: usize) -> Self {
        Self { limit: limit.max(1), order: VecDeque::new(), states: HashMap::new() }
    }

    fn insert(&mut self, id: PollId, state: JobState) {
        if self.states.insert(id.clone(), state).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: &PollId) {
        if self.states.remove(id).is_some() {
            self.order.retain(|retired| retired != id);
        }
    }

    fn get(&self, id: &PollId) -> Option<JobState> {
        self.states.get(id).copied()
    }
}

/// Clears the in-flight flag even if the tick future is dropped midway.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PollScheduler {
    store: Arc<dyn PollStore>,
    platform: Arc<dyn ChatPlatform>,
    reconciler: ReactionReconciler,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    jobs: Mutex<HashMap<PollId, JobEntry>>,
    retired: Mutex<RetiredStates>,
}

impl PollScheduler {
    pub fn new(
        store: Arc<dyn PollStore>,
        platform: Arc<dyn ChatPlatform>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        let reconciler = ReactionReconciler::new(platform.clone(), settings.reconcile_timeout);
        Self {
            store,
            platform,
            reconciler,
            clock,
            settings,
            jobs: Mutex::new(HashMap::new()),
            retired: Mutex::new(RetiredStates::new(RETIRED_STATE_LIMIT)),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<PollId, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn retired(&self) -> MutexGuard<'_, RetiredStates> {
        self.retired.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn render_limits(&self) -> RenderLimits {
        let mut limits = self.settings.render_limits;
        limits.message_char_limit =
            limits.message_char_limit.min(self.platform.message_char_limit());
        limits
    }

    /// Starts a job for an Active poll. Returns `false` when the poll is not
    /// Active or already has a job.
    pub fn register(self: &Arc<Self>, record: &PollRecord) -> bool {
        if !record.is_active() {
            return false;
        }

        let mut jobs = self.jobs();
        if jobs.contains_key(&record.id) {
            return false;
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(run_job(
            Arc::downgrade(self),
            record.id.clone(),
            token.clone(),
            self.settings.tick_interval,
        ));
        jobs.insert(
            record.id.clone(),
            JobEntry {
                state: JobState::Active,
                token,
                in_flight: Arc::new(AtomicBool::new(false)),
                task: Some(task),
            },
        );
        drop(jobs);
        self.retired().remove(&record.id);

        info!(
            event_name = "poll.scheduler.registered",
            poll_id = %record.id,
            channel_id = %record.channel_id,
            expires_at = %record.expires_at,
            "poll job registered"
        );
        true
    }

    /// Stops a job without recording a terminal state.
    pub fn cancel(&self, id: &PollId) -> bool {
        let Some(entry) = self.jobs().remove(id) else {
            return false;
        };
        entry.token.cancel();
        info!(event_name = "poll.scheduler.cancelled", poll_id = %id, "poll job cancelled");
        true
    }

    pub fn is_scheduled(&self, id: &PollId) -> bool {
        self.jobs().contains_key(id)
    }

    pub fn scheduled_ids(&self) -> Vec<PollId> {
        let mut ids: Vec<PollId> = self.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn scheduled_count(&self) -> usize {
        self.jobs().len()
    }

    pub fn state(&self, id: &PollId) -> Option<JobState> {
        if let Some(entry) = self.jobs().get(id) {
            return Some(entry.state);
        }
        self.retired().get(id)
    }

    /// Cancels every job and waits for running ticks to finish.
    pub async fn shutdown(&self) {
        let entries: Vec<(PollId, JobEntry)> = self.jobs().drain().collect();
        for (_, entry) in &entries {
            entry.token.cancel();
        }

        let count = entries.len();
        for (id, entry) in entries {
            if let Some(task) = entry.task {
                if let Err(error) = task.await {
                    warn!(
                        event_name = "poll.scheduler.shutdown",
                        poll_id = %id,
                        error = %error,
                        "poll job ended abnormally"
                    );
                }
            }
        }
        info!(event_name = "poll.scheduler.shutdown", job_count = count, "poll scheduler stopped");
    }

    fn in_flight_flag(&self, id: &PollId) -> Option<Arc<AtomicBool>> {
        self.jobs().get(id).map(|entry| entry.in_flight.clone())
    }

    fn set_state(&self, id: &PollId, state: JobState) {
        if let Some(entry) = self.jobs().get_mut(id) {
            entry.state = state;
        }
    }

    fn retire(&self, id: &PollId, state: JobState) {
        if let Some(entry) = self.jobs().remove(id) {
            entry.token.cancel();
        }
        self.retired().insert(id.clone(), state);
    }

    /// Runs one tick for a scheduled poll. A tick requested while another is
    /// running for the same poll is skipped, not queued.
    pub async fn tick(&self, id: &PollId) -> TickOutcome {
        let Some(in_flight) = self.in_flight_flag(id) else {
            return TickOutcome::NotScheduled;
        };
        if in_flight.swap(true, Ordering::SeqCst) {
            debug!(event_name = "poll.scheduler.tick_skipped", poll_id = %id, "tick already running");
            return TickOutcome::Skipped;
        }
        let _guard = InFlightGuard(in_flight);

        let outcome = self.run_tick(id).await;
        match outcome {
            TickOutcome::Finalized => self.retire(id, JobState::Finalized),
            TickOutcome::Aborted => self.retire(id, JobState::Aborted),
            _ => {}
        }
        outcome
    }

    async fn run_tick(&self, id: &PollId) -> TickOutcome {
        let correlation_id = Uuid::new_v4().to_string();
        let record = match self.store.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(
                    event_name = "poll.scheduler.tick_aborted",
                    correlation_id = %correlation_id,
                    poll_id = %id,
                    "poll record missing from store; stopping job"
                );
                return TickOutcome::Aborted;
            }
            Err(error) => {
                warn!(
                    event_name = "poll.scheduler.store_failed",
                    correlation_id = %correlation_id,
                    poll_id = %id,
                    error = %error,
                    "could not read poll record; skipping tick"
                );
                return TickOutcome::StoreFailed;
            }
        };

        if !record.is_active() {
            return TickOutcome::Finalized;
        }
        if record.is_expired_at(self.clock.now()) {
            return self.finalize(record).await;
        }

        let message_id = record.id.message_id();
        let counts =
            match self.reconciler.reconcile(&record.channel_id, &message_id, &record.options).await {
                Ok(counts) => counts,
                Err(error @ ReconcileError::RateLimited(_)) => {
                    warn!(
                        event_name = "poll.scheduler.tick_rate_limited",
                        correlation_id = %correlation_id,
                        poll_id = %id,
                        channel_id = %record.channel_id,
                        error = %error,
                        "reconciliation rate limited; skipping tick"
                    );
                    return TickOutcome::RateLimited;
                }
                Err(error) if !error.is_terminal() => {
                    warn!(
                        event_name = "poll.scheduler.tick_timed_out",
                        correlation_id = %correlation_id,
                        poll_id = %id,
                        channel_id = %record.channel_id,
                        error = %error,
                        "reconciliation timed out; skipping tick"
                    );
                    return TickOutcome::TimedOut;
                }
                Err(error) => {
                    warn!(
                        event_name = "poll.scheduler.tick_aborted",
                        correlation_id = %correlation_id,
                        poll_id = %id,
                        channel_id = %record.channel_id,
                        error = %error,
                        "reconciliation failed; stopping poll"
                    );
                    return TickOutcome::Aborted;
                }
            };

        let mut updated = record.clone();
        let changed = match updated.apply_counts(
            &counts,
            self.clock.now(),
            self.settings.history_limit,
        ) {
            Ok(changed) => changed,
            Err(error) => {
                warn!(
                    event_name = "poll.scheduler.tick_aborted",
                    correlation_id = %correlation_id,
                    poll_id = %id,
                    error = %error,
                    "observed counts rejected; stopping poll"
                );
                return TickOutcome::Aborted;
            }
        };

        let content = render(&updated.options, RenderMode::Live, self.render_limits());
        if let Err(error) =
            self.platform.edit_message(&record.channel_id, &message_id, &content).await
        {
            if error.is_transient() {
                warn!(
                    event_name = "poll.scheduler.tick_rate_limited",
                    correlation_id = %correlation_id,
                    poll_id = %id,
                    channel_id = %record.channel_id,
                    error = %error,
                    "poll message edit rate limited; skipping tick"
                );
                return TickOutcome::RateLimited;
            }
            warn!(
                event_name = "poll.scheduler.tick_aborted",
                correlation_id = %correlation_id,
                poll_id = %id,
                channel_id = %record.channel_id,
                error = %error,
                "poll message edit failed; stopping poll"
            );
            return TickOutcome::Aborted;
        }

        if changed {
            if let Err(error) = self.store.upsert(updated).await {
                warn!(
                    event_name = "poll.scheduler.store_failed",
                    correlation_id = %correlation_id,
                    poll_id = %id,
                    error = %error,
                    "could not persist counts; poll stays active"
                );
                return TickOutcome::StoreFailed;
            }
        }

        debug!(
            event_name = "poll.scheduler.tick_applied",
            correlation_id = %correlation_id,
            poll_id = %id,
            votes = ?counts,
            changed,
            "poll tick applied"
        );
        TickOutcome::Applied { changed }
    }

    /// Closes a poll: one last reconcile (stored counts if that fails), the
    /// final render, and `Finalized` persisted even when the edit fails.
    pub async fn finalize(&self, record: PollRecord) -> TickOutcome {
        let id = record.id.clone();
        if !record.is_active() {
            self.retire(&id, JobState::Finalized);
            return TickOutcome::Finalized;
        }
        self.set_state(&id, JobState::Finalizing);

        let mut record = record;
        let message_id = record.id.message_id();
        match self.reconciler.reconcile(&record.channel_id, &message_id, &record.options).await {
            Ok(counts) => {
                if let Err(error) =
                    record.apply_counts(&counts, self.clock.now(), self.settings.history_limit)
                {
                    warn!(
                        event_name = "poll.scheduler.finalize_fallback",
                        poll_id = %id,
                        error = %error,
                        "final counts rejected; using stored counts"
                    );
                }
            }
            Err(error) => {
                warn!(
                    event_name = "poll.scheduler.finalize_fallback",
                    poll_id = %id,
                    channel_id = %record.channel_id,
                    error = %error,
                    "final reconciliation failed; using stored counts"
                );
            }
        }

        if let Err(error) = record.finalize() {
            warn!(
                event_name = "poll.scheduler.finalize_failed",
                poll_id = %id,
                error = %error,
                "poll could not be finalized"
            );
            self.retire(&id, JobState::Aborted);
            return TickOutcome::Aborted;
        }

        let content = render(&record.options, RenderMode::Final, self.render_limits());
        if let Err(error) =
            self.platform.edit_message(&record.channel_id, &message_id, &content).await
        {
            warn!(
                event_name = "poll.scheduler.final_edit_failed",
                poll_id = %id,
                channel_id = %record.channel_id,
                error = %error,
                "final results could not be posted"
            );
        }

        let votes = record.vote_counts();
        if let Err(error) = self.store.upsert(record).await {
            error!(
                event_name = "poll.scheduler.store_failed",
                poll_id = %id,
                error = %error,
                "could not persist finalized poll"
            );
        }

        self.retire(&id, JobState::Finalized);
        info!(
            event_name = "poll.scheduler.finalized",
            poll_id = %id,
            votes = ?votes,
            "poll finalized"
        );
        TickOutcome::Finalized
    }
}

async fn run_job(
    scheduler: Weak<PollScheduler>,
    id: PollId,
    token: CancellationToken,
    period: Duration,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        if scheduler.tick(&id).await.is_terminal() {
            break;
        }
    }

    debug!(event_name = "poll.scheduler.job_stopped", poll_id = %id, "poll job stopped");
}
