use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;

use pollbot_core::domain::poll::{NewPoll, Poll, PollId};

use super::{PollRepository, RepositoryError};

/// Process-local store with the same contract as the SQL gateway. Mutations
/// hold the write lock for their whole read-modify-write, which is what makes
/// them atomic here.
#[derive(Default)]
pub struct InMemoryPollRepository {
    polls: RwLock<HashMap<String, Poll>>,
}

#[async_trait::async_trait]
impl PollRepository for InMemoryPollRepository {
    async fn create_poll(&self, new_poll: NewPoll) -> Result<Poll, RepositoryError> {
        let mut polls = self.polls.write().await;
        if polls.contains_key(&new_poll.id.0) {
            return Err(RepositoryError::DuplicateId(new_poll.id));
        }

        let poll = Poll::open(new_poll, Utc::now());
        polls.insert(poll.id.0.clone(), poll.clone());
        Ok(poll)
    }

    async fn record_vote(&self, id: &PollId, option: &str) -> Result<(), RepositoryError> {
        let mut polls = self.polls.write().await;
        let poll = polls.get_mut(&id.0).ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        poll.record_vote(option)?;
        Ok(())
    }

    async fn get_results(&self, id: &PollId) -> Result<Option<Poll>, RepositoryError> {
        let polls = self.polls.read().await;
        Ok(polls.get(&id.0).cloned())
    }

    async fn end_poll(&self, id: &PollId) -> Result<(), RepositoryError> {
        let mut polls = self.polls.write().await;
        let poll = polls.get_mut(&id.0).ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        poll.end(Utc::now())?;
        Ok(())
    }

    async fn delete_poll(&self, id: &PollId) -> Result<(), RepositoryError> {
        let mut polls = self.polls.write().await;
        polls.remove(&id.0).map(|_| ()).ok_or_else(|| RepositoryError::NotFound(id.clone()))
    }
}
