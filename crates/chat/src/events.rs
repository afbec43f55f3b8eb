use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::commands::{error_reply, parse_command_line, CommandRouter};

pub const FALLBACK_REPLY: &str = "Failed to send response. Please try again later.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostedMessage {
    pub post_id: String,
    pub author_id: String,
    pub channel_id: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    Posted(PostedMessage),
    Unsupported { event_type: String },
}

impl ChatEvent {
    pub fn event_type(&self) -> ChatEventType {
        match self {
            Self::Posted(_) => ChatEventType::Posted,
            Self::Unsupported { .. } => ChatEventType::Unsupported,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChatEventType {
    Posted,
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    SelfAuthored,
    NotACommand,
    MissingChannel,
    Unhandled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Responded { channel_id: String, text: String },
    Ignored(IgnoreReason),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> ChatEventType;
    async fn handle(&self, event: &ChatEvent, ctx: &EventContext) -> HandlerResult;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("chat server rejected the post with HTTP {0}")]
    Http(u16),
    #[error("chat request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<(), SendError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ignored(IgnoreReason),
    Replied,
    FallbackSent,
    Dropped,
}

pub struct EventDispatcher {
    handlers: HashMap<ChatEventType, Arc<dyn EventHandler>>,
    sender: Arc<dyn MessageSender>,
}

impl EventDispatcher {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { handlers: HashMap::new(), sender }
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(handler.event_type(), Arc::new(handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Runs the registered handler and delivers its reply. Never fails: a
    /// reply that cannot be sent is replaced by the fallback text once, and
    /// dropped if that fails too.
    pub async fn dispatch(&self, event: &ChatEvent, ctx: &EventContext) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(&event.event_type()) else {
            return DispatchOutcome::Ignored(IgnoreReason::Unhandled);
        };

        match handler.handle(event, ctx).await {
            HandlerResult::Ignored(reason) => {
                debug!(
                    event_name = "chat.event.ignored",
                    correlation_id = %ctx.correlation_id,
                    reason = ?reason,
                    "event ignored"
                );
                DispatchOutcome::Ignored(reason)
            }
            HandlerResult::Responded { channel_id, text } => {
                self.deliver(&channel_id, &text, ctx).await
            }
        }
    }

    async fn deliver(&self, channel_id: &str, text: &str, ctx: &EventContext) -> DispatchOutcome {
        let Err(send_error) = self.sender.send_text(channel_id, text).await else {
            return DispatchOutcome::Replied;
        };

        warn!(
            event_name = "chat.reply.send_failed",
            correlation_id = %ctx.correlation_id,
            channel_id,
            error = %send_error,
            "failed to send reply; sending fallback"
        );

        match self.sender.send_text(channel_id, FALLBACK_REPLY).await {
            Ok(()) => DispatchOutcome::FallbackSent,
            Err(fallback_error) => {
                error!(
                    event_name = "chat.reply.dropped",
                    correlation_id = %ctx.correlation_id,
                    channel_id,
                    error = %fallback_error,
                    "fallback reply failed; dropping response"
                );
                DispatchOutcome::Dropped
            }
        }
    }
}

/// Turns posted command messages into replies.
pub struct CommandMessageHandler {
    bot_user_id: String,
    router: Arc<CommandRouter>,
}

impl CommandMessageHandler {
    pub fn new(bot_user_id: impl Into<String>, router: Arc<CommandRouter>) -> Self {
        Self { bot_user_id: bot_user_id.into(), router }
    }
}

#[async_trait]
impl EventHandler for CommandMessageHandler {
    fn event_type(&self) -> ChatEventType {
        ChatEventType::Posted
    }

    async fn handle(&self, event: &ChatEvent, ctx: &EventContext) -> HandlerResult {
        let ChatEvent::Posted(message) = event else {
            return HandlerResult::Ignored(IgnoreReason::Unhandled);
        };
        if message.author_id == self.bot_user_id {
            return HandlerResult::Ignored(IgnoreReason::SelfAuthored);
        }
        let Some(line) = parse_command_line(&message.text) else {
            return HandlerResult::Ignored(IgnoreReason::NotACommand);
        };
        if message.channel_id.is_empty() {
            return HandlerResult::Ignored(IgnoreReason::MissingChannel);
        }

        info!(
            event_name = "chat.command.received",
            correlation_id = %ctx.correlation_id,
            channel_id = %message.channel_id,
            verb = %line.verb,
            "received command"
        );

        let text = match self.router.route(&line, &message.author_id).await {
            Ok(reply) => reply,
            Err(command_error) => {
                if command_error.is_internal() {
                    error!(
                        event_name = "chat.command.failed",
                        correlation_id = %ctx.correlation_id,
                        channel_id = %message.channel_id,
                        verb = %line.verb,
                        error = %command_error,
                        "command failed on the store"
                    );
                } else {
                    warn!(
                        event_name = "chat.command.rejected",
                        correlation_id = %ctx.correlation_id,
                        channel_id = %message.channel_id,
                        verb = %line.verb,
                        error = %command_error,
                        "command rejected"
                    );
                }
                error_reply(&command_error)
            }
        };

        HandlerResult::Responded { channel_id: message.channel_id.clone(), text }
    }
}
