mod bootstrap;
mod health;

use anyhow::Result;
use pollbot_core::config::{AppConfig, LoadOptions};
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use pollbot_core::config::LogFormat::*;

    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.db_pool.clone(),
        app.supervisor.subscribe(),
    )
    .await?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bot_user_id = %app.bot_user.id,
        bot_username = %app.bot_user.username,
        "pollbot started"
    );

    let outcome = tokio::select! {
        result = app.supervisor.run() => result.map_err(anyhow::Error::from),
        signal = tokio::signal::ctrl_c() => {
            tracing::info!(
                event_name = "system.server.stopping",
                correlation_id = "shutdown",
                "shutdown signal received"
            );
            signal.map_err(anyhow::Error::from)
        }
    };

    app.db_pool.close().await;
    outcome
}
