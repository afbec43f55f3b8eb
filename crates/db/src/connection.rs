use std::future::Future;
use std::time::Duration;

use pollbot_core::retry::BackoffPolicy;
use sqlx::sqlite::SqlitePoolOptions;
use thiserror::Error;
use tracing::{info, warn};

pub type DbPool = sqlx::SqlitePool;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectSettings {
    pub database_url: String,
    pub max_connections: u32,
    pub attempt_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("database connect attempt timed out after {0:?}")]
    AttemptTimedOut(Duration),
    #[error("database connect failed: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("database liveness check failed: {0}")]
    Liveness(#[source] sqlx::Error),
    #[error("database connection failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<ConnectError>,
    },
}

pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
}

pub async fn ping(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await.map(|_| ())
}

/// Opens the pool, retrying with `policy` until a connection both opens and
/// answers a liveness ping. Exhausting the policy is meant to be fatal.
pub async fn connect_with_backoff(
    settings: &ConnectSettings,
    policy: &BackoffPolicy,
) -> Result<DbPool, ConnectError> {
    retry_with_policy(policy, |_| connect_once(settings)).await
}

async fn retry_with_policy<T, F, Fut>(
    policy: &BackoffPolicy,
    mut attempt_once: F,
) -> Result<T, ConnectError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ConnectError>>,
{
    let mut attempt = 0_u32;

    loop {
        let error = match attempt_once(attempt).await {
            Ok(value) => {
                info!(
                    event_name = "system.database.connected",
                    attempt = attempt + 1,
                    "database connection established and verified"
                );
                return Ok(value);
            }
            Err(error) => error,
        };

        if !policy.should_retry(attempt) {
            warn!(
                event_name = "system.database.connect_exhausted",
                attempts = attempt + 1,
                error = %error,
                "database connection retries exhausted"
            );
            return Err(ConnectError::Exhausted { attempts: attempt + 1, last: Box::new(error) });
        }

        let delay = policy.delay_for(attempt);
        warn!(
            event_name = "system.database.connect_retry",
            attempt = attempt + 1,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "database connection attempt failed; retrying"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

async fn connect_once(settings: &ConnectSettings) -> Result<DbPool, ConnectError> {
    let timeout_secs = settings.attempt_timeout.as_secs();
    let pool = tokio::time::timeout(
        settings.attempt_timeout,
        connect_with_settings(&settings.database_url, settings.max_connections, timeout_secs),
    )
    .await
    .map_err(|_| ConnectError::AttemptTimedOut(settings.attempt_timeout))?
    .map_err(ConnectError::Connect)?;

    verify_liveness(pool, settings.attempt_timeout).await
}

/// A pool that opened but does not answer the ping is closed and reported as
/// a failed attempt.
async fn verify_liveness(pool: DbPool, attempt_timeout: Duration) -> Result<DbPool, ConnectError> {
    match tokio::time::timeout(attempt_timeout, ping(&pool)).await {
        Ok(Ok(())) => Ok(pool),
        Ok(Err(error)) => {
            pool.close().await;
            Err(ConnectError::Liveness(error))
        }
        Err(_) => {
            pool.close().await;
            Err(ConnectError::AttemptTimedOut(attempt_timeout))
        }
    }
}
