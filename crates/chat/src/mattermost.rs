use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::events::{ChatEvent, MessageSender, PostedMessage, SendError};
use crate::supervisor::{ChatTransport, TransportError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type SocketStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ChatApiError {
    #[error("chat API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("chat API returned HTTP {0}")]
    Status(u16),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BotUser {
    pub id: String,
    #[serde(default)]
    pub username: String,
}

/// REST side of the Mattermost v4 API.
#[derive(Clone)]
pub struct MattermostClient {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
}

impl MattermostClient {
    pub fn new(base_url: &str, token: SecretString) -> Result<Self, ChatApiError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_owned(), token })
    }

    pub fn websocket_url(&self) -> String {
        format!("{}/api/v4/websocket", self.base_url.replacen("http", "ws", 1))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn fetch_bot_user(&self) -> Result<BotUser, ChatApiError> {
        let response = self
            .http
            .get(self.endpoint("/api/v4/users/me"))
            .bearer_auth(self.token.expose_secret())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatApiError::Status(status.as_u16()));
        }

        Ok(response.json::<BotUser>().await?)
    }
}

#[async_trait]
impl MessageSender for MattermostClient {
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<(), SendError> {
        let response = self
            .http
            .post(self.endpoint("/api/v4/posts"))
            .bearer_auth(self.token.expose_secret())
            .json(&json!({ "channel_id": channel_id, "message": text }))
            .send()
            .await
            .map_err(|error| SendError::Request(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SendError::Http(status.as_u16()));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed websocket frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("posted event carries no post payload")]
    MissingPost,
}

#[derive(Deserialize)]
struct SocketFrame {
    event: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct RawPost {
    #[serde(default)]
    id: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    message: String,
}

/// Decodes one websocket text frame. Replies to our own requests carry no
/// `event` key and yield `Ok(None)`.
pub fn parse_socket_frame(text: &str) -> Result<Option<ChatEvent>, FrameError> {
    let frame: SocketFrame = serde_json::from_str(text)?;
    let Some(event_type) = frame.event else {
        return Ok(None);
    };
    if event_type != "posted" {
        return Ok(Some(ChatEvent::Unsupported { event_type }));
    }

    let raw = frame.data.get("post").and_then(Value::as_str).ok_or(FrameError::MissingPost)?;
    let post: RawPost = serde_json::from_str(raw)?;

    Ok(Some(ChatEvent::Posted(PostedMessage {
        post_id: post.id,
        author_id: post.user_id,
        channel_id: post.channel_id,
        text: post.message,
    })))
}

/// Websocket event stream authenticated with the bot token.
pub struct MattermostSocket {
    client: MattermostClient,
    stream: Mutex<Option<SocketStream>>,
    seq: AtomicU64,
}

impl MattermostSocket {
    pub fn new(client: MattermostClient) -> Self {
        Self { client, stream: Mutex::new(None), seq: AtomicU64::new(0) }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl ChatTransport for MattermostSocket {
    async fn connect(&self) -> Result<(), TransportError> {
        let url = self.client.websocket_url();
        let (mut stream, _) = connect_async(url.as_str())
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;

        let challenge = json!({
            "seq": self.next_seq(),
            "action": "authentication_challenge",
            "data": { "token": self.client.token.expose_secret() },
        });
        stream
            .send(Message::Text(challenge.to_string()))
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;

        info!(event_name = "chat.websocket.connected", url = %url, "websocket connected");
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn next_event(&self) -> Result<Option<ChatEvent>, TransportError> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Ok(None);
        };

        loop {
            let Some(frame) = stream.next().await else {
                return Ok(None);
            };

            match frame.map_err(|error| TransportError::Receive(error.to_string()))? {
                Message::Text(text) => match parse_socket_frame(&text) {
                    Ok(Some(event)) => return Ok(Some(event)),
                    Ok(None) => debug!(event_name = "chat.websocket.reply", "skipping reply frame"),
                    Err(frame_error) => warn!(
                        event_name = "chat.websocket.malformed_frame",
                        error = %frame_error,
                        "skipping malformed websocket frame"
                    ),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(mut stream) = self.stream.lock().await.take() else {
            return Ok(());
        };

        stream.close(None).await.map_err(|error| TransportError::Disconnect(error.to_string()))
    }
}
