//! Client-side harness for the `capsync` WebSocket channels. Integration tests
//! and local tooling drive the server through these instead of hand-parsing
//! frames.

use std::time::Duration;

use capsync_core::{ProtocolError, StatusMessage, ToggleRequest};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

pub const PARTICIPANT_PATH: &str = "/ws";
pub const OBSERVER_PATH: &str = "/status";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid status frame: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("server closed the connection (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },
    #[error("no frame within {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    /// Close code the server sent, if this error is a close.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            ClientError::Closed { code, .. } => *code,
            _ => None,
        }
    }
}

/// Joins `base_url` (e.g. `ws://127.0.0.1:8000`) and a channel path.
pub fn channel_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

struct Channel {
    stream: WsStream,
}

impl Channel {
    async fn open(url: &str) -> Result<Self, ClientError> {
        let (stream, _) = connect_async(url).await?;
        debug!(%url, "connected");
        Ok(Self { stream })
    }

    async fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.stream.send(Message::text(text)).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<StatusMessage, ClientError> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => return Ok(text.as_str().parse()?),
                Message::Binary(_) => return Err(ProtocolError::NotText.into()),
                Message::Close(frame) => {
                    return Err(ClientError::Closed {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame
                            .map(|f| f.reason.as_str().to_owned())
                            .unwrap_or_default(),
                    })
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
        Err(ClientError::Closed {
            code: None,
            reason: String::new(),
        })
    }

    async fn next_message_within(
        &mut self,
        limit: Duration,
    ) -> Result<StatusMessage, ClientError> {
        tokio::time::timeout(limit, self.next_message())
            .await
            .map_err(|_| ClientError::Timeout(limit))?
    }

    async fn close(mut self) -> Result<(), ClientError> {
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Read/write connection on the participant channel.
pub struct ParticipantClient {
    channel: Channel,
}

impl ParticipantClient {
    pub async fn connect(base_url: &str) -> Result<Self, ClientError> {
        let channel = Channel::open(&channel_url(base_url, PARTICIPANT_PATH)).await?;
        Ok(Self { channel })
    }

    pub async fn toggle(&mut self, enabled: bool) -> Result<(), ClientError> {
        self.channel
            .send_text(ToggleRequest::new(enabled).as_str())
            .await
    }

    /// Sends `text` verbatim, valid or not.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ClientError> {
        self.channel.send_text(text).await
    }

    pub async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), ClientError> {
        self.channel.stream.send(Message::binary(bytes)).await?;
        Ok(())
    }

    pub async fn next_message(&mut self) -> Result<StatusMessage, ClientError> {
        self.channel.next_message().await
    }

    pub async fn next_message_within(
        &mut self,
        limit: Duration,
    ) -> Result<StatusMessage, ClientError> {
        self.channel.next_message_within(limit).await
    }

    pub async fn close(self) -> Result<(), ClientError> {
        self.channel.close().await
    }
}

/// Read-only connection on the observer channel.
pub struct ObserverClient {
    channel: Channel,
}

impl ObserverClient {
    pub async fn connect(base_url: &str) -> Result<Self, ClientError> {
        let channel = Channel::open(&channel_url(base_url, OBSERVER_PATH)).await?;
        Ok(Self { channel })
    }

    pub async fn next_message(&mut self) -> Result<StatusMessage, ClientError> {
        self.channel.next_message().await
    }

    pub async fn next_message_within(
        &mut self,
        limit: Duration,
    ) -> Result<StatusMessage, ClientError> {
        self.channel.next_message_within(limit).await
    }

    /// Observers may send frames; the server ignores them.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ClientError> {
        self.channel.send_text(text).await
    }

    pub async fn close(self) -> Result<(), ClientError> {
        self.channel.close().await
    }
}
