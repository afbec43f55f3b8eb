use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use pollbot_chat::supervisor::ConnectionState;
use pollbot_db::DbPool;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    chat_state: watch::Receiver<ConnectionState>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub chat: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, chat_state: watch::Receiver<ConnectionState>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, chat_state })
}

pub async fn spawn(
    bind_address: &str,
    port: u16,
    db_pool: DbPool,
    chat_state: watch::Receiver<ConnectionState>,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(db_pool, chat_state)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let chat = chat_check(*state.chat_state.borrow());
    let ready = database.status == "ready" && chat.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        chat,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match pollbot_db::ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn chat_check(state: ConnectionState) -> HealthCheck {
    let status = if state == ConnectionState::Connected { "ready" } else { "degraded" };
    HealthCheck { status, detail: format!("chat connection {}", state.as_str()) }
}
