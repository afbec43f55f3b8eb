use std::sync::Arc;

use pollbot_core::domain::poll::{NewPoll, Poll, PollId};
use pollbot_core::errors::ApplicationError;
use pollbot_db::repositories::PollRepository;
use thiserror::Error;
use tracing::info;

pub const KNOWN_COMMANDS: [&str; 5] = ["create_vote", "vote", "results", "end_vote", "delete_vote"];

const CREATE_VOTE_USAGE: &str = "/create_vote <question> <option1> [option2]...";
const VOTE_USAGE: &str = "/vote <ID> <option>";
const RESULTS_USAGE: &str = "/results <ID>";
const END_VOTE_USAGE: &str = "/end_vote <ID>";
const DELETE_VOTE_USAGE: &str = "/delete_vote <ID>";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub verb: String,
    pub args: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollCommand {
    CreateVote { question: String, options: Vec<String> },
    Vote { id: PollId, option: String },
    Results { id: PollId },
    EndVote { id: PollId },
    DeleteVote { id: PollId },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("{context}: {source}")]
    Failed {
        context: &'static str,
        #[source]
        source: ApplicationError,
    },
}

impl CommandError {
    fn failed(context: &'static str, source: impl Into<ApplicationError>) -> Self {
        Self::Failed { context, source: source.into() }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Usage(usage) => format!("usage: {usage}"),
            Self::UnknownCommand(verb) => format!(
                "unknown command `{verb}`. Available commands: {}",
                KNOWN_COMMANDS.join(", ")
            ),
            Self::Failed { context, source } => format!("{context}: {}", source.user_message()),
        }
    }

    /// True when the failure came from the store rather than from the user.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Failed { source, .. } if source.is_internal())
    }
}

pub fn error_reply(error: &CommandError) -> String {
    format!("**Error:** {}", error.user_message())
}

/// Splits a chat message into verb and arguments. Only text that starts
/// with `/` is a command. The verb runs from the slash to the first
/// whitespace and is lower-cased, so `/` or `/ vote` yield an empty verb
/// that routes as an unknown command. Double-quoted segments stay one
/// argument.
pub fn parse_command_line(text: &str) -> Option<CommandLine> {
    let body = text.strip_prefix('/')?;
    let (verb, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));

    Some(CommandLine { verb: verb.to_ascii_lowercase(), args: tokenize(rest) })
}

fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;

    for ch in input.chars() {
        match ch {
            '"' | '\u{201c}' | '\u{201d}' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            ch if ch.is_whitespace() && !in_quotes => {
                if !current.is_empty() || quoted {
                    tokens.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            ch => current.push(ch),
        }
    }

    if !current.is_empty() || quoted {
        tokens.push(current);
    }
    tokens
}

impl PollCommand {
    pub fn parse(verb: &str, args: &[String]) -> Result<Self, CommandError> {
        match verb {
            "create_vote" => match args {
                [question, options @ ..] if !options.is_empty() => Ok(Self::CreateVote {
                    question: question.clone(),
                    options: options.to_vec(),
                }),
                _ => Err(CommandError::Usage(CREATE_VOTE_USAGE)),
            },
            "vote" => match args {
                [id, option] => Ok(Self::Vote { id: PollId(id.clone()), option: option.clone() }),
                _ => Err(CommandError::Usage(VOTE_USAGE)),
            },
            "results" => single_id(args, RESULTS_USAGE).map(|id| Self::Results { id }),
            "end_vote" => single_id(args, END_VOTE_USAGE).map(|id| Self::EndVote { id }),
            "delete_vote" => single_id(args, DELETE_VOTE_USAGE).map(|id| Self::DeleteVote { id }),
            other => Err(CommandError::UnknownCommand(other.to_owned())),
        }
    }
}

fn single_id(args: &[String], usage: &'static str) -> Result<PollId, CommandError> {
    match args {
        [id] => Ok(PollId(id.clone())),
        _ => Err(CommandError::Usage(usage)),
    }
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> PollId;
}

#[derive(Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> PollId {
        PollId::generate()
    }
}

pub struct CommandRouter {
    repository: Arc<dyn PollRepository>,
    ids: Arc<dyn IdGenerator>,
}

impl CommandRouter {
    pub fn new(repository: Arc<dyn PollRepository>) -> Self {
        Self::with_id_generator(repository, Arc::new(UuidGenerator))
    }

    pub fn with_id_generator(repository: Arc<dyn PollRepository>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { repository, ids }
    }

    pub async fn route(&self, line: &CommandLine, author_id: &str) -> Result<String, CommandError> {
        let command = PollCommand::parse(&line.verb, &line.args)?;
        self.execute(command, author_id).await
    }

    pub async fn execute(
        &self,
        command: PollCommand,
        author_id: &str,
    ) -> Result<String, CommandError> {
        match command {
            PollCommand::CreateVote { question, options } => {
                let context = "failed to create vote";
                let new_poll = NewPoll::new(self.ids.next_id(), author_id, question, options)
                    .map_err(|error| CommandError::failed(context, error))?;
                let poll = self
                    .repository
                    .create_poll(new_poll)
                    .await
                    .map_err(|error| CommandError::failed(context, error))?;

                info!(
                    event_name = "poll.created",
                    poll_id = %poll.id,
                    option_count = poll.options.len(),
                    "vote created"
                );
                Ok(format!(
                    "Vote created with ID: {}\nOptions: {}",
                    poll.id,
                    poll.option_labels().join(", ")
                ))
            }
            PollCommand::Vote { id, option } => {
                self.repository
                    .record_vote(&id, &option)
                    .await
                    .map_err(|error| CommandError::failed("failed to record vote", error))?;

                info!(event_name = "poll.vote_recorded", poll_id = %id, "vote recorded");
                Ok(format!("Vote for {option} recorded successfully!"))
            }
            PollCommand::Results { id } => {
                let context = "failed to fetch results";
                let poll = self
                    .repository
                    .get_results(&id)
                    .await
                    .map_err(|error| CommandError::failed(context, error))?
                    .ok_or_else(|| CommandError::failed(context, ApplicationError::NotFound(id)))?;

                Ok(format_results(&poll))
            }
            PollCommand::EndVote { id } => {
                self.repository
                    .end_poll(&id)
                    .await
                    .map_err(|error| CommandError::failed("failed to end vote", error))?;

                info!(event_name = "poll.ended", poll_id = %id, "vote ended");
                Ok(format!("Vote {id} has been ended"))
            }
            PollCommand::DeleteVote { id } => {
                self.repository
                    .delete_poll(&id)
                    .await
                    .map_err(|error| CommandError::failed("failed to delete vote", error))?;

                info!(event_name = "poll.deleted", poll_id = %id, "vote deleted");
                Ok(format!("Vote {id} deleted successfully"))
            }
        }
    }
}

/// Options are listed in creation order, so repeated calls render identically
/// apart from the counts.
pub fn format_results(poll: &Poll) -> String {
    let mut output = format!("**Results for vote {}**\n{}\n", poll.id, poll.question);
    for option in &poll.options {
        output.push_str(&format!("- {}: {}\n", option.label, option.votes));
    }

    let total = poll.total_votes();
    let plural = if total == 1 { "" } else { "s" };
    output.push_str(&format!("Status: {} ({total} vote{plural} total)", poll.status.as_str()));
    output
}
