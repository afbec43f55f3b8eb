use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PollId(pub String);

impl PollId {
    /// Fresh random v4 identifier; polls are keyed by caller-generated ids.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PollId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Active,
    Ended,
}

impl PollStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub label: String,
    pub votes: u64,
}

/// A validated request to open a poll. Construction is the only place the
/// option set is checked; after that it never changes shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPoll {
    pub id: PollId,
    pub creator: String,
    pub question: String,
    pub options: Vec<String>,
}

impl NewPoll {
    pub fn new(
        id: PollId,
        creator: impl Into<String>,
        question: impl Into<String>,
        options: Vec<String>,
    ) -> Result<Self, DomainError> {
        if options.is_empty() {
            return Err(DomainError::EmptyOptions);
        }

        let mut seen = HashSet::with_capacity(options.len());
        for label in &options {
            if label.trim().is_empty() {
                return Err(DomainError::EmptyOptionLabel);
            }
            if !seen.insert(label.as_str()) {
                return Err(DomainError::DuplicateOption(label.clone()));
            }
        }

        Ok(Self { id, creator: creator.into(), question: question.into(), options })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: PollId,
    pub creator: String,
    pub question: String,
    pub options: Vec<PollOption>,
    pub status: PollStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Poll {
    pub fn open(new_poll: NewPoll, created_at: DateTime<Utc>) -> Self {
        Self {
            id: new_poll.id,
            creator: new_poll.creator,
            question: new_poll.question,
            options: new_poll
                .options
                .into_iter()
                .map(|label| PollOption { label, votes: 0 })
                .collect(),
            status: PollStatus::Active,
            created_at,
            ended_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PollStatus::Active
    }

    pub fn votes_for(&self, label: &str) -> Option<u64> {
        self.options.iter().find(|option| option.label == label).map(|option| option.votes)
    }

    pub fn total_votes(&self) -> u64 {
        self.options.iter().map(|option| option.votes).sum()
    }

    pub fn option_labels(&self) -> Vec<&str> {
        self.options.iter().map(|option| option.label.as_str()).collect()
    }

    pub fn record_vote(&mut self, label: &str) -> Result<(), DomainError> {
        if !self.is_active() {
            return Err(DomainError::PollEnded(self.id.clone()));
        }

        let option = self
            .options
            .iter_mut()
            .find(|option| option.label == label)
            .ok_or_else(|| DomainError::UnknownOption(label.to_owned()))?;
        option.votes += 1;
        Ok(())
    }

    pub fn end(&mut self, at: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.is_active() {
            return Err(DomainError::AlreadyEnded(self.id.clone()));
        }

        self.status = PollStatus::Ended;
        self.ended_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{NewPoll, Poll, PollId, PollStatus};
    use crate::errors::DomainError;

    fn color_poll() -> Poll {
        let new_poll = NewPoll::new(
            PollId("poll-1".to_string()),
            "U1",
            "Best color?",
            vec!["red".to_string(), "blue".to_string()],
        )
        .expect("valid poll");
        Poll::open(new_poll, Utc::now())
    }

    #[test]
    fn opened_poll_starts_active_with_zero_counts() {
        let poll = color_poll();
        assert_eq!(poll.status, PollStatus::Active);
        assert_eq!(poll.ended_at, None);
        assert_eq!(poll.option_labels(), vec!["red", "blue"]);
        assert_eq!(poll.total_votes(), 0);
    }

    #[test]
    fn rejects_empty_missing_and_duplicate_options() {
        let id = PollId("p".to_string());
        assert_eq!(NewPoll::new(id.clone(), "U1", "q", vec![]), Err(DomainError::EmptyOptions));
        assert_eq!(
            NewPoll::new(id.clone(), "U1", "q", vec!["a".to_string(), "  ".to_string()]),
            Err(DomainError::EmptyOptionLabel)
        );
        assert_eq!(
            NewPoll::new(id, "U1", "q", vec!["a".to_string(), "a".to_string()]),
            Err(DomainError::DuplicateOption("a".to_string()))
        );
    }

    #[test]
    fn votes_only_touch_the_chosen_option() {
        let mut poll = color_poll();
        for _ in 0..3 {
            poll.record_vote("red").expect("vote red");
        }

        assert_eq!(poll.votes_for("red"), Some(3));
        assert_eq!(poll.votes_for("blue"), Some(0));
        assert_eq!(poll.option_labels(), vec!["red", "blue"]);
    }

    #[test]
    fn unknown_option_leaves_counts_unchanged() {
        let mut poll = color_poll();
        poll.record_vote("red").expect("vote red");

        let error = poll.record_vote("green").expect_err("green is not an option");
        assert_eq!(error, DomainError::UnknownOption("green".to_string()));
        assert_eq!(poll.total_votes(), 1);
    }

    #[test]
    fn ending_is_one_way() {
        let mut poll = color_poll();
        poll.record_vote("blue").expect("vote blue");
        poll.end(Utc::now()).expect("first end");
        let ended_at = poll.ended_at;

        assert!(matches!(poll.end(Utc::now()), Err(DomainError::AlreadyEnded(_))));
        assert!(matches!(poll.record_vote("red"), Err(DomainError::PollEnded(_))));
        assert_eq!(poll.status, PollStatus::Ended);
        assert_eq!(poll.ended_at, ended_at);
        assert_eq!(poll.votes_for("blue"), Some(1));
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(PollId::generate(), PollId::generate());
    }
}
