use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

const INBOUND_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport channel is not open")]
    NotOpen,
    #[error("transport is already connected")]
    AlreadyConnected,
    #[error("invalid relay url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
    Closed,
}

pub type InboundStream = ReceiverStream<Value>;

#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn is_open(&self) -> bool;
    async fn send(&self, frame: Value) -> Result<(), TransportError>;
}

pub struct OfflineTransport;

#[async_trait]
impl TransportChannel for OfflineTransport {
    fn is_open(&self) -> bool {
        false
    }

    async fn send(&self, _frame: Value) -> Result<(), TransportError> {
        Err(TransportError::NotOpen)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

/// Rewrites `http(s)://` to `ws(s)://` and rejects anything else that is not
/// a websocket url.
pub fn normalize_relay_url(raw: &str) -> Result<Url, TransportError> {
    let raw = raw.trim();
    let rewritten = if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        raw.to_string()
    };

    let url = Url::parse(&rewritten).map_err(|err| TransportError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        scheme => Err(TransportError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {scheme}"),
        }),
    }
}

/// One logical connection to the relay. A background task owns the socket
/// and reconnects with backoff; sends while it is down fail with
/// [`TransportError::NotOpen`] and are not queued.
pub struct WebSocketTransport {
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            policy,
            state,
            outbound: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Starts the connection task. `registration` is written first on every
    /// (re)connect so the relay knows whom to forward to.
    pub async fn connect(
        &self,
        url: &str,
        registration: Option<Value>,
    ) -> Result<InboundStream, TransportError> {
        let url = normalize_relay_url(url)?;
        let registration = registration
            .map(|frame| serde_json::to_string(&frame))
            .transpose()?;

        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(TransportError::AlreadyConnected);
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        *self.outbound.lock().await = Some(outbound_tx);

        let connection = Connection {
            url,
            registration,
            policy: self.policy.clone(),
            state: self.state.clone(),
            outbound: outbound_rx,
            inbound: inbound_tx,
        };
        *task = Some(tokio::spawn(connection.run()));
        Ok(ReceiverStream::new(inbound_rx))
    }

    pub async fn close(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.outbound.lock().await.take();
        self.state.send_replace(ConnectionState::Closed);
        info!("relay transport closed");
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl TransportChannel for WebSocketTransport {
    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    async fn send(&self, frame: Value) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        let text = serde_json::to_string(&frame)?;
        let outbound = self.outbound.lock().await;
        let Some(sender) = outbound.as_ref() else {
            return Err(TransportError::NotOpen);
        };
        sender.send(text).map_err(|_| TransportError::NotOpen)
    }
}

struct Connection {
    url: Url,
    registration: Option<String>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::Sender<Value>,
}

enum SessionEnd {
    Dropped,
    Shutdown,
}

impl Connection {
    async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            self.state.send_replace(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting { attempt }
            });

            match connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    attempt = 0;
                    info!(url = %self.url, "relay connected");
                    if let SessionEnd::Shutdown = self.session(ws_stream).await {
                        self.state.send_replace(ConnectionState::Closed);
                        return;
                    }
                    info!(url = %self.url, "relay disconnected");
                }
                Err(error) => {
                    warn!(url = %self.url, attempt, %error, "relay connect failed");
                }
            }

            attempt += 1;
            if self.policy.exhausted(attempt) {
                warn!(url = %self.url, attempt, "giving up on relay reconnect");
                self.state.send_replace(ConnectionState::Closed);
                return;
            }
            self.state
                .send_replace(ConnectionState::Reconnecting { attempt });
            tokio::time::sleep(self.policy.delay_for(attempt)).await;
        }
    }

    async fn session<S>(&mut self, ws_stream: S) -> SessionEnd
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut writer, mut reader) = ws_stream.split();

        let stale = drain_stale(&mut self.outbound);
        if stale > 0 {
            warn!(dropped = stale, "discarding sends queued before the connection dropped");
        }

        if let Some(registration) = &self.registration {
            if let Err(error) = writer.send(Message::Text(registration.clone())).await {
                warn!(%error, "failed to register with relay");
                return SessionEnd::Dropped;
            }
        }
        self.state.send_replace(ConnectionState::Open);

        loop {
            tokio::select! {
                frame = self.outbound.recv() => {
                    let Some(text) = frame else {
                        let _ = writer.close().await;
                        return SessionEnd::Shutdown;
                    };
                    if let Err(error) = writer.send(Message::Text(text)).await {
                        warn!(%error, "relay send failed");
                        return SessionEnd::Dropped;
                    }
                }
                message = reader.next() => match message {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            if self.inbound.send(value).await.is_err() {
                                debug!("inbound consumer dropped; stopping transport");
                                let _ = writer.close().await;
                                return SessionEnd::Shutdown;
                            }
                        }
                        Err(error) => warn!(%error, "discarding unparseable relay frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(%error, "relay receive failed");
                        return SessionEnd::Dropped;
                    }
                },
            }
        }
    }
}

fn drain_stale(outbound: &mut mpsc::UnboundedReceiver<String>) -> usize {
    let mut dropped = 0;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
