pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{
    connect_with_backoff, connect_with_settings, ping, ConnectError, ConnectSettings, DbPool,
};
pub use repositories::{InMemoryPollRepository, PollRepository, RepositoryError, SqlPollRepository};
