use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use pollbot_core::retry::BackoffPolicy;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::events::{ChatEvent, EventContext, EventDispatcher};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("initial chat connection failed: {0}")]
    InitialConnect(TransportError),
    #[error("chat reconnect failed after {attempts} attempt(s): {last}")]
    ReconnectFailed { attempts: u32, last: TransportError },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Terminated,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Terminated => "terminated",
        }
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    /// `Ok(None)` means the server closed the stream.
    async fn next_event(&self) -> Result<Option<ChatEvent>, TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Owns the event stream. Events are handled one at a time, to completion,
/// in arrival order.
pub struct ReconnectionSupervisor {
    transport: Arc<dyn ChatTransport>,
    dispatcher: EventDispatcher,
    reconnect_policy: BackoffPolicy,
    state: watch::Sender<ConnectionState>,
    sequence: AtomicU64,
}

impl ReconnectionSupervisor {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        dispatcher: EventDispatcher,
        reconnect_policy: BackoffPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self { transport, dispatcher, reconnect_policy, state, sequence: AtomicU64::new(0) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Runs until the connection is lost for good. Only returns on failure.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        info!(event_name = "chat.connection.opening", "opening chat connection");
        if let Err(connect_error) = self.transport.connect().await {
            error!(
                event_name = "chat.connection.failed",
                error = %connect_error,
                "initial chat connection failed"
            );
            self.set_state(ConnectionState::Terminated);
            return Err(SupervisorError::InitialConnect(connect_error));
        }
        self.set_state(ConnectionState::Connected);
        info!(event_name = "chat.connection.established", "chat connection established");

        loop {
            self.pump().await;
            self.set_state(ConnectionState::Disconnected);

            if let Err(disconnect_error) = self.transport.disconnect().await {
                warn!(
                    event_name = "chat.connection.disconnect_failed",
                    error = %disconnect_error,
                    "failed to close chat connection cleanly"
                );
            }

            self.reconnect().await?;
        }
    }

    async fn pump(&self) {
        loop {
            match self.transport.next_event().await {
                Ok(Some(event)) => {
                    let ctx = self.context_for(&event);
                    let outcome = self.dispatcher.dispatch(&event, &ctx).await;
                    debug!(
                        event_name = "chat.event.dispatched",
                        correlation_id = %ctx.correlation_id,
                        event_type = ?event.event_type(),
                        outcome = ?outcome,
                        "event dispatched"
                    );
                }
                Ok(None) => {
                    warn!(event_name = "chat.connection.closed", "chat event stream closed");
                    return;
                }
                Err(receive_error) => {
                    warn!(
                        event_name = "chat.connection.receive_failed",
                        error = %receive_error,
                        "chat event stream failed"
                    );
                    return;
                }
            }
        }
    }

    async fn reconnect(&self) -> Result<(), SupervisorError> {
        self.set_state(ConnectionState::Reconnecting);
        let mut attempt = 0_u32;

        let last = loop {
            info!(event_name = "chat.connection.reconnecting", attempt, "reconnecting to chat");
            let connect_error = match self.transport.connect().await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    info!(event_name = "chat.connection.reestablished", attempt, "chat reconnected");
                    return Ok(());
                }
                Err(connect_error) => connect_error,
            };

            warn!(
                event_name = "chat.connection.reconnect_failed",
                attempt,
                max_attempts = self.reconnect_policy.max_attempts,
                error = %connect_error,
                "chat reconnect attempt failed"
            );
            if !self.reconnect_policy.should_retry(attempt) {
                break connect_error;
            }

            let delay = self.reconnect_policy.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        };

        let attempts = attempt + 1;
        error!(
            event_name = "chat.connection.terminated",
            attempts,
            error = %last,
            "chat reconnect budget exhausted"
        );
        self.set_state(ConnectionState::Terminated);
        Err(SupervisorError::ReconnectFailed { attempts, last })
    }

    fn context_for(&self, event: &ChatEvent) -> EventContext {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let correlation_id = match event {
            ChatEvent::Posted(message) if !message.post_id.is_empty() => message.post_id.clone(),
            _ => format!("event-{sequence}"),
        };
        EventContext { correlation_id }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}
