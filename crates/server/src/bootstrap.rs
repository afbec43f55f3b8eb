use std::sync::Arc;

use pollbot_chat::{
    commands::CommandRouter,
    events::{CommandMessageHandler, EventDispatcher, MessageSender},
    mattermost::{BotUser, ChatApiError, MattermostClient, MattermostSocket},
    supervisor::ReconnectionSupervisor,
};
use pollbot_core::config::{AppConfig, ConfigError, DatabaseConfig};
use pollbot_db::{
    connect_with_backoff, migrations, ConnectError, ConnectSettings, DbPool, PollRepository,
    SqlPollRepository,
};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub bot_user: BotUser,
    pub supervisor: ReconnectionSupervisor,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("chat client setup failed: {0}")]
    ChatClient(#[source] ChatApiError),
    #[error("bot authentication failed: {0}")]
    ChatAuth(#[source] ChatApiError),
    #[error(transparent)]
    DatabaseConnect(#[from] ConnectError),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

#[cfg(test)]
pub async fn bootstrap(
    options: pollbot_core::config::LoadOptions,
) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let client = MattermostClient::new(&config.chat.server_url, config.chat.bot_token.clone())
        .map_err(BootstrapError::ChatClient)?;
    let bot_user = client.fetch_bot_user().await.map_err(BootstrapError::ChatAuth)?;
    info!(
        event_name = "system.bootstrap.bot_authenticated",
        correlation_id = "bootstrap",
        bot_user_id = %bot_user.id,
        "bot identity resolved"
    );

    let db_pool = connect_store(&config.database).await?;

    let repository = Arc::new(SqlPollRepository::with_operation_timeout(
        db_pool.clone(),
        config.database.operation_timeout(),
    ));
    let dispatcher = build_dispatcher(&bot_user.id, repository, Arc::new(client.clone()));
    let supervisor = ReconnectionSupervisor::new(
        Arc::new(MattermostSocket::new(client)),
        dispatcher,
        config.chat.reconnect_policy(),
    );

    Ok(Application { config, db_pool, bot_user, supervisor })
}

pub async fn connect_store(database: &DatabaseConfig) -> Result<DbPool, BootstrapError> {
    let settings = ConnectSettings {
        database_url: database.url.clone(),
        max_connections: database.max_connections,
        attempt_timeout: database.connect_timeout(),
    };

    let db_pool = connect_with_backoff(&settings, &database.connect_policy()).await?;
    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    Ok(db_pool)
}

pub fn build_dispatcher(
    bot_user_id: &str,
    repository: Arc<dyn PollRepository>,
    sender: Arc<dyn MessageSender>,
) -> EventDispatcher {
    let router = Arc::new(CommandRouter::new(repository));
    let mut dispatcher = EventDispatcher::new(sender);
    dispatcher.register(CommandMessageHandler::new(bot_user_id, router));
    dispatcher
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use pollbot_chat::events::{
        ChatEvent, DispatchOutcome, EventContext, MessageSender, PostedMessage, SendError,
    };
    use pollbot_core::config::{AppConfig, ConfigOverrides, LoadOptions};
    use pollbot_db::{ConnectError, InMemoryPollRepository};

    use crate::bootstrap::{bootstrap, build_dispatcher, connect_store, BootstrapError};

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send_text(&self, _channel_id: &str, text: &str) -> Result<(), SendError> {
            self.sent.lock().expect("sent lock").push(text.to_owned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_without_chat_settings() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                chat_server_url: Some("ftp://chat.example.com".to_string()),
                chat_bot_token: Some("token".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("chat.server_url"), "{message}");
    }

    #[tokio::test]
    async fn bootstrap_fails_when_the_bot_cannot_authenticate() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                chat_server_url: Some("http://127.0.0.1:1".to_string()),
                chat_bot_token: Some("token".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        assert!(matches!(result, Err(BootstrapError::ChatAuth(_))));
    }

    #[tokio::test]
    async fn connect_store_applies_migrations() {
        let mut database = AppConfig::default().database;
        database.url = "sqlite::memory:".to_string();
        database.max_connections = 1;

        let pool = connect_store(&database).await.expect("store should connect");
        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('votes', 'vote_options')",
        )
        .fetch_one(&pool)
        .await
        .expect("count tables");

        assert_eq!(table_count, 2);
        pool.close().await;
    }

    #[tokio::test]
    async fn connect_store_gives_up_after_the_configured_attempts() {
        let mut database = AppConfig::default().database;
        database.url = "sqlite:///pollbot-missing-dir/nested/pollbot.db".to_string();
        database.connect_max_attempts = 2;
        database.connect_initial_delay_ms = 0;

        let error = connect_store(&database).await.expect_err("missing directory");

        assert!(matches!(
            error,
            BootstrapError::DatabaseConnect(ConnectError::Exhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn dispatcher_routes_commands_to_the_repository() {
        let sender = Arc::new(RecordingSender::default());
        let dispatcher =
            build_dispatcher("bot", Arc::new(InMemoryPollRepository::default()), sender.clone());
        assert_eq!(dispatcher.handler_count(), 1);

        let event = ChatEvent::Posted(PostedMessage {
            post_id: "p1".to_owned(),
            author_id: "U1".to_owned(),
            channel_id: "C1".to_owned(),
            text: "/create_vote Lunch? tacos ramen".to_owned(),
        });
        let outcome = dispatcher.dispatch(&event, &EventContext::default()).await;

        assert_eq!(outcome, DispatchOutcome::Replied);
        let sent = sender.sent.lock().expect("sent lock");
        assert!(sent[0].starts_with("Vote created with ID: "));
    }
}
