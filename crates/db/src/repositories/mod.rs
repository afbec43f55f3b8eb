use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use pollbot_core::domain::poll::{NewPoll, Poll, PollId};
use pollbot_core::errors::{ApplicationError, DomainError};

pub mod memory;
pub mod poll;

pub use memory::InMemoryPollRepository;
pub use poll::SqlPollRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("vote `{0}` not found")]
    NotFound(PollId),
    #[error("vote `{0}` already exists")]
    DuplicateId(PollId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound(id) => Self::NotFound(id),
            RepositoryError::Domain(error) => Self::Validation(error),
            RepositoryError::Schema(message) => Self::Schema(message),
            RepositoryError::Timeout(after) => Self::Timeout(after.as_millis() as u64),
            RepositoryError::DuplicateId(id) => Self::Store(format!("vote id `{id}` collided")),
            RepositoryError::Database(error) => Self::Store(error.to_string()),
        }
    }
}

/// Persistence gateway for polls. Every call is a single round trip to the
/// store; implementations must not cache between calls.
#[async_trait]
pub trait PollRepository: Send + Sync {
    async fn create_poll(&self, new_poll: NewPoll) -> Result<Poll, RepositoryError>;

    /// Adds exactly one vote to `option`. Fails without touching any count
    /// when the poll is missing, ended, or has no such option.
    async fn record_vote(&self, id: &PollId, option: &str) -> Result<(), RepositoryError>;

    async fn get_results(&self, id: &PollId) -> Result<Option<Poll>, RepositoryError>;

    async fn end_poll(&self, id: &PollId) -> Result<(), RepositoryError>;

    async fn delete_poll(&self, id: &PollId) -> Result<(), RepositoryError>;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pollbot_core::domain::poll::PollId;
    use pollbot_core::errors::{ApplicationError, DomainError};

    use super::RepositoryError;

    #[test]
    fn repository_errors_map_onto_application_taxonomy() {
        let id = PollId("p1".to_owned());

        assert_eq!(
            ApplicationError::from(RepositoryError::NotFound(id.clone())),
            ApplicationError::NotFound(id.clone())
        );
        assert_eq!(
            ApplicationError::from(RepositoryError::Domain(DomainError::PollEnded(id.clone()))),
            ApplicationError::Validation(DomainError::PollEnded(id.clone()))
        );
        assert_eq!(
            ApplicationError::from(RepositoryError::Timeout(Duration::from_secs(2))),
            ApplicationError::Timeout(2_000)
        );
        assert!(ApplicationError::from(RepositoryError::DuplicateId(id)).is_internal());
        assert!(ApplicationError::from(RepositoryError::Schema("bad".to_owned())).is_internal());
    }
}
