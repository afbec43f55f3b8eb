use thiserror::Error;

use crate::domain::poll::PollId;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("at least one option is required")]
    EmptyOptions,
    #[error("empty option labels are not allowed")]
    EmptyOptionLabel,
    #[error("option `{0}` is listed more than once")]
    DuplicateOption(String),
    #[error("option `{0}` is not part of this vote")]
    UnknownOption(String),
    #[error("vote `{0}` has ended and no longer accepts votes")]
    PollEnded(PollId),
    #[error("vote `{0}` was already ended")]
    AlreadyEnded(PollId),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("vote `{0}` not found")]
    NotFound(PollId),
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("store failure: {0}")]
    Store(String),
    #[error("store record failed schema check: {0}")]
    Schema(String),
    #[error("store operation timed out after {0}ms")]
    Timeout(u64),
}

impl ApplicationError {
    /// Text that is safe to post back into a channel. Store internals never
    /// appear here; they are logged by the caller instead.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound(id) => format!("vote ID `{id}` not found"),
            Self::Validation(error) => error.to_string(),
            Self::Store(_) | Self::Schema(_) | Self::Timeout(_) => {
                "The vote store is temporarily unavailable. Please try again shortly.".to_owned()
            }
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Schema(_) | Self::Timeout(_))
    }
}
