pub mod config;
pub mod domain;
pub mod errors;
pub mod retry;

pub use domain::poll::{NewPoll, Poll, PollId, PollOption, PollStatus};
pub use errors::{ApplicationError, DomainError};
pub use retry::BackoffPolicy;
