use std::sync::Arc;
use std::time::Duration;

use tallybot_chat::events::dispatcher_for;
use tallybot_chat::gateway::{GatewayRunner, GatewayTransport, NoopGatewayTransport};
use tallybot_chat::interactions::{
    interaction_channel, DiscordInteractionResponder, InteractionError, InteractionSender,
    InteractionVerifier,
};
use tallybot_chat::{ChatError, ChatPlatform, DiscordRestClient};
use tallybot_core::config::{AppConfig, ConfigError, LoadOptions};
use tallybot_core::{Clock, SystemClock};
use tallybot_db::{JsonFilePollStore, PollStore};
use tallybot_polls::{
    CreatorSettings, PollCreator, PollResults, PollScheduler, PollService, ReactionReconciler,
    RecoveryCoordinator, RecoveryReport, SchedulerSettings,
};
use thiserror::Error;
use tracing::{info, warn};

const INTERACTION_QUEUE_CAPACITY: usize = 64;

pub struct Application {
    pub config: AppConfig,
    pub store: Arc<dyn PollStore>,
    pub scheduler: Arc<PollScheduler>,
    pub recovery: RecoveryReport,
    pub gateway: GatewayRunner,
    /// Present when slash commands are accepted over HTTP.
    pub interactions: Option<InteractionIngress>,
}

#[derive(Clone)]
pub struct InteractionIngress {
    pub verifier: Arc<InteractionVerifier>,
    pub sender: InteractionSender,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("discord client setup failed: {0}")]
    Chat(#[from] ChatError),
    #[error("interaction endpoint setup failed: {0}")]
    Interactions(#[from] InteractionError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        store_path = %config.store.path.display(),
        "starting application bootstrap"
    );

    let store: Arc<dyn PollStore> = Arc::new(JsonFilePollStore::new(config.store.path.clone()));
    let discord = Arc::new(DiscordRestClient::new(
        &config.discord.api_base_url,
        config.discord.bot_token.clone(),
        Duration::from_secs(config.discord.timeout_secs),
    )?);

    let mut interactions = None;
    let transport: Arc<dyn GatewayTransport> = match config.discord.interactions() {
        Some((application_id, public_key)) => {
            let verifier = InteractionVerifier::from_hex(public_key)?;
            let responder = DiscordInteractionResponder::new(discord.clone(), application_id);
            let (sender, transport) =
                interaction_channel(INTERACTION_QUEUE_CAPACITY, Arc::new(responder));
            interactions = Some(InteractionIngress { verifier: Arc::new(verifier), sender });
            Arc::new(transport)
        }
        None => {
            warn!(
                event_name = "system.bootstrap.interactions_disabled",
                correlation_id = "bootstrap",
                "discord.application_id/public_key not set; slash commands are disabled"
            );
            Arc::new(NoopGatewayTransport)
        }
    };

    let mut app = assemble(config, store, discord, Arc::new(SystemClock), transport).await;
    app.interactions = interactions;
    Ok(app)
}

/// Wires the poll lifecycle over the given seams and runs recovery before
/// anything can accept commands.
pub async fn assemble(
    config: AppConfig,
    store: Arc<dyn PollStore>,
    platform: Arc<dyn ChatPlatform>,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn GatewayTransport>,
) -> Application {
    let polls = &config.polls;
    let scheduler = Arc::new(PollScheduler::new(
        store.clone(),
        platform.clone(),
        clock.clone(),
        SchedulerSettings::from_config(polls),
    ));

    let recovery =
        RecoveryCoordinator::new(store.clone(), platform.clone(), scheduler.clone(), clock.clone())
            .run()
            .await;

    let creator = PollCreator::new(
        platform.clone(),
        store.clone(),
        scheduler.clone(),
        clock,
        CreatorSettings::from_config(polls, config.discord.guild_id.clone()),
    );
    let results = PollResults::new(
        store.clone(),
        platform.clone(),
        ReactionReconciler::new(platform, polls.reconcile_timeout()),
        polls.render_limits(),
    );
    let service = PollService::new(creator, results, polls.clone());
    let gateway = GatewayRunner::new(transport, dispatcher_for(service));

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        resumed = recovery.resumed,
        finalized = recovery.finalized,
        skipped = recovery.skipped,
        "poll lifecycle ready"
    );

    Application { config, store, scheduler, recovery, gateway, interactions: None }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use tallybot_chat::gateway::NoopGatewayTransport;
    use tallybot_chat::{ChatPlatform, InMemoryChatPlatform};
    use tallybot_core::config::{AppConfig, ConfigOverrides, LoadOptions};
    use tallybot_core::domain::poll::{ChannelId, PollId, PollOption, PollRecord, PollStatus};
    use tallybot_core::ManualClock;
    use tallybot_db::{InMemoryPollStore, PollStore};
    use tallybot_polls::RecoveryReport;

    use crate::bootstrap::{assemble, bootstrap};

    #[tokio::test]
    async fn bootstrap_fails_fast_without_bot_token() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                discord_bot_token: Some("Bot prefixed".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().map(|error| error.to_string()).unwrap_or_default();
        assert!(message.contains("discord.bot_token"), "unexpected error: {message}");
    }

    fn record(id: &str, channel: &ChannelId, created: chrono::DateTime<Utc>) -> PollRecord {
        PollRecord::new(
            PollId(id.to_string()),
            channel.clone(),
            created,
            created + Duration::hours(24),
            vec![PollOption {
                emoji: "🇦".to_string(),
                label: "only".to_string(),
                source_ref: "m".to_string(),
                votes: 0,
            }],
        )
        .expect("valid poll")
    }

    #[tokio::test]
    async fn assemble_recovers_stored_polls_before_returning() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).single().expect("timestamp");
        let channel = ChannelId("100".to_string());
        let platform = Arc::new(InMemoryChatPlatform::default());
        platform.add_channel(&channel);
        let live = platform.send_message(&channel, "live").await.expect("send");
        let stale = platform.send_message(&channel, "stale").await.expect("send");

        let store = Arc::new(InMemoryPollStore::default());
        store.upsert(record(&live.id.0, &channel, now - Duration::hours(1))).await.expect("seed");
        store.upsert(record(&stale.id.0, &channel, now - Duration::hours(30))).await.expect("seed");

        let app = assemble(
            AppConfig::default(),
            store.clone(),
            platform,
            Arc::new(ManualClock::new(now)),
            Arc::new(NoopGatewayTransport),
        )
        .await;

        assert_eq!(app.recovery, RecoveryReport { resumed: 1, finalized: 1, skipped: 0 });
        assert!(app.scheduler.is_scheduled(&PollId(live.id.0.clone())));
        let closed = store.get(&PollId(stale.id.0)).await.expect("read").expect("stored");
        assert_eq!(closed.status, PollStatus::Finalized);
        assert!(app.interactions.is_none());
        app.scheduler.shutdown().await;
    }
}
