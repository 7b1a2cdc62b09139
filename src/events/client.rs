//! Event stream subscriber with fixed-delay reconnect.
//!
//! There is no replay: events published while disconnected are lost. Every
//! reconnect after the first is announced to the consumer as a `resync`
//! event so it can reload authoritative state.

use std::fmt::Write as _;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::ws::KEEP_ALIVE_MARKER;
use crate::board::model::{BoardEvent, EventFilter, EventType};
use crate::config::StreamConfig;
use crate::error::ChannelError;

/// One decoded frame from the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Event(BoardEvent),
    KeepAlive,
}

/// Decode a text frame.
pub fn parse_frame(text: &str) -> Result<StreamMessage, ChannelError> {
    if text.trim() == KEEP_ALIVE_MARKER {
        return Ok(StreamMessage::KeepAlive);
    }
    serde_json::from_str(text)
        .map(StreamMessage::Event)
        .map_err(|e| ChannelError::InvalidMessage(e.to_string()))
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Waiting to retry; `attempt` counts from 1.
    Reconnecting { attempt: u32 },
    /// Gave up, or the consumer went away.
    Disconnected,
}

/// Frames from one connection, ending when the connection drops.
pub type FrameStream = BoxStream<'static, Result<String, ChannelError>>;

/// Opens a connection to the push channel.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn connect(&self) -> Result<FrameStream, ChannelError>;
}

/// WebSocket transport against `/ws/events`.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    /// `base_url` is the server's `ws://host:port`.
    pub fn new(base_url: &str, filter: &EventFilter) -> Self {
        let mut url = format!("{}/ws/events", base_url.trim_end_matches('/'));
        let mut sep = '?';
        let mut push = |key: &str, value: String| {
            let _ = write!(url, "{sep}{key}={value}");
            sep = '&';
        };
        if let Some(t) = filter.event_type {
            push("type", t.as_str().to_string());
        }
        if let Some(id) = filter.ticket_id {
            push("ticket_id", id.to_string());
        }
        if let Some(id) = filter.run_id {
            push("run_id", id.to_string());
        }
        Self { url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventTransport for WsTransport {
    async fn connect(&self) -> Result<FrameStream, ChannelError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::ConnectFailed {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        let frames = ws.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::Disconnected {
                    reason: e.to_string(),
                })),
            }
        });
        Ok(frames.boxed())
    }
}

/// Keeps a subscription alive across disconnects.
pub struct EventStreamClient<T> {
    transport: T,
    config: StreamConfig,
    state_tx: watch::Sender<ConnectionState>,
}

impl<T: EventTransport> EventStreamClient<T> {
    pub fn new(transport: T, config: StreamConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            transport,
            config,
            state_tx,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Forward events into `events` until retries run out.
    ///
    /// The retry counter resets after every successful connect, and each
    /// reconnect is signalled with a `resync` event. Returns `Ok(())` if the
    /// receiver is dropped, `RetriesExhausted` otherwise.
    pub async fn run(&self, events: mpsc::Sender<BoardEvent>) -> Result<(), ChannelError> {
        let mut retries: u32 = 0;
        let mut connected_before = false;

        loop {
            if retries == 0 {
                self.state_tx.send_replace(ConnectionState::Connecting);
            }

            match self.transport.connect().await {
                Ok(mut frames) => {
                    retries = 0;
                    self.state_tx.send_replace(ConnectionState::Connected);
                    info!(reconnect = connected_before, "Event stream connected");

                    if connected_before {
                        let resync = BoardEvent::new(EventType::Resync)
                            .with_payload(json!({ "reason": "reconnected" }));
                        if events.send(resync).await.is_err() {
                            self.state_tx.send_replace(ConnectionState::Disconnected);
                            return Ok(());
                        }
                    }
                    connected_before = true;

                    while let Some(frame) = frames.next().await {
                        match frame.and_then(|text| parse_frame(&text)) {
                            Ok(StreamMessage::Event(event)) => {
                                if events.send(event).await.is_err() {
                                    self.state_tx.send_replace(ConnectionState::Disconnected);
                                    return Ok(());
                                }
                            }
                            Ok(StreamMessage::KeepAlive) => debug!("Event stream keep-alive"),
                            Err(ChannelError::InvalidMessage(e)) => {
                                warn!(error = %e, "Skipping malformed event frame");
                            }
                            Err(e) => {
                                warn!(error = %e, "Event stream dropped");
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Event stream connect failed"),
            }

            if events.is_closed() {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return Ok(());
            }

            retries += 1;
            if retries > self.config.max_retries {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                warn!(
                    attempts = self.config.max_retries,
                    "Event stream giving up"
                );
                return Err(ChannelError::RetriesExhausted {
                    attempts: self.config.max_retries,
                    delay: self.config.retry_delay,
                });
            }
            self.state_tx
                .send_replace(ConnectionState::Reconnecting { attempt: retries });
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }
}
