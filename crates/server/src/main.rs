mod bootstrap;
mod health;
mod interactions;

use std::time::Duration;

use anyhow::Result;
use axum::Router;
use tallybot_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use tallybot_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    // Recovery completes inside bootstrap, before any endpoint is reachable.
    let app = bootstrap::bootstrap_with_config(config).await?;

    let mut routes =
        health::router(health::HealthState::new(app.store.clone(), app.scheduler.clone()));
    if let Some(ingress) = app.interactions.clone() {
        routes = Router::new().merge(routes).merge(interactions::router(ingress));
    }
    health::spawn(&app.config.server.bind_address, app.config.server.health_check_port, routes)
        .await?;

    let gateway = app.gateway;
    let gateway_task = tokio::spawn(async move { gateway.run().await });

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        scheduled_polls = app.scheduler.scheduled_count(),
        interactions_enabled = app.interactions.is_some(),
        "tallybot-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "tallybot-server stopping"
    );

    gateway_task.abort();
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, app.scheduler.shutdown()).await.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "poll jobs did not stop within the grace period"
        );
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
