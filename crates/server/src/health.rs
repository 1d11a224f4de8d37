use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tallybot_db::PollStore;
use tallybot_polls::PollScheduler;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    store: Arc<dyn PollStore>,
    scheduler: Arc<PollScheduler>,
}

impl HealthState {
    pub fn new(store: Arc<dyn PollStore>, scheduler: Arc<PollScheduler>) -> Self {
        Self { store, scheduler }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub store: HealthCheck,
    pub scheduled_polls: usize,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn spawn(bind_address: &str, port: u16, router: Router) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.http.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "http endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router).await {
            error!(
                event_name = "system.http.error",
                correlation_id = "bootstrap",
                error = %error,
                "http endpoint terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let store = store_check(state.store.as_ref()).await;
    let ready = store.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "tallybot-server runtime initialized".to_string(),
        },
        store,
        scheduled_polls: state.scheduler.scheduled_count(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn store_check(store: &dyn PollStore) -> HealthCheck {
    match store.load().await {
        Ok(polls) => HealthCheck {
            status: "ready",
            detail: format!("poll store readable ({} polls)", polls.len()),
        },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("poll store unreadable: {error}") }
        }
    }
}
