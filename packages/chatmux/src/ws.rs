//! WebSocket transport for [`ChannelConnection`].
//!
//! [`spawn`] starts a driver task that owns the socket. It always reconnects,
//! backing off exponentially up to a cap. Messages queued while the link is
//! down are discarded, never replayed.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::connection::{ChannelConnection, ConnectionDriver, ConnectionState};
use crate::protocol::ProtocolMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsConfig {
    pub url: String,
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outbound_capacity: 64,
            inbound_capacity: 256,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }

    /// The URL without its query string, which may carry a token.
    pub fn redacted_url(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("server unavailable")]
    Unavailable,

    #[error("connection closed")]
    Closed,

    #[error("websocket error: {0}")]
    Transport(#[source] tungstenite::Error),
}

impl WsError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Io(io_err)
                if matches!(
                    io_err.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                ) =>
            {
                Self::Unavailable
            }
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed
            }
            _ => Self::Transport(err),
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Closed => "closed",
            Self::Transport(_) => "transport",
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum PumpExit {
    /// The socket went away; reconnect.
    Disconnected,
    /// The last handle or the inbound consumer is gone; stop the driver.
    Shutdown,
}

/// Start the driver. Inbound messages arrive on the returned receiver.
pub fn spawn(
    config: WsConfig,
) -> (ChannelConnection, mpsc::Receiver<ProtocolMessage>, JoinHandle<()>) {
    let (connection, driver) = ChannelConnection::new(config.outbound_capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
    let handle = tokio::spawn(run_driver(config, driver, inbound_tx));
    (connection, inbound_rx, handle)
}

async fn run_driver(
    config: WsConfig,
    mut driver: ConnectionDriver,
    inbound: mpsc::Sender<ProtocolMessage>,
) {
    let mut backoff = Backoff::new(config.reconnect_initial, config.reconnect_max);
    let url = config.redacted_url().to_string();

    loop {
        driver.set_state(ConnectionState::Connecting);
        debug!(%url, "connecting");

        match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Ok((stream, _response)) => {
                info!(%url, "connected");
                driver.set_state(ConnectionState::Open);
                backoff.reset();
                match pump(stream, &mut driver, &inbound).await {
                    Ok(PumpExit::Shutdown) => break,
                    Ok(PumpExit::Disconnected) => info!(%url, "connection closed"),
                    Err(err) => warn!(%url, error = %err, "connection lost"),
                }
            }
            Err(err) => match WsError::from_tungstenite(err) {
                WsError::Unavailable => info!(%url, "server unavailable"),
                err => warn!(%url, error = %err, "connect failed"),
            },
        }

        driver.set_state(ConnectionState::Closed);
        let dropped = driver.discard_pending();
        if dropped > 0 {
            debug!(dropped, "discarded messages queued while disconnected");
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "reconnecting after delay");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inbound.closed() => break,
        }
    }

    driver.set_state(ConnectionState::Closed);
    debug!("websocket driver stopped");
}

async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    driver: &mut ConnectionDriver,
    inbound: &mpsc::Sender<ProtocolMessage>,
) -> Result<PumpExit, WsError> {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            outbound = driver.outbound.recv() => {
                let Some(message) = outbound else {
                    let _ = sink.close().await;
                    return Ok(PumpExit::Shutdown);
                };
                match message.encode() {
                    Ok(text) => sink
                        .send(Message::text(text))
                        .await
                        .map_err(WsError::from_tungstenite)?,
                    Err(err) => warn!(action = %message.action(), error = %err, "failed to encode outbound message"),
                }
            }

            frame = source.next() => {
                match frame {
                    None => return Ok(PumpExit::Disconnected),
                    Some(Err(err)) => return Err(WsError::from_tungstenite(err)),
                    Some(Ok(Message::Text(text))) => match ProtocolMessage::decode(text.as_str()) {
                        Ok(message) => {
                            if inbound.send(message).await.is_err() {
                                let _ = sink.close().await;
                                return Ok(PumpExit::Shutdown);
                            }
                        }
                        Err(err) => warn!(code = err.error_code(), error = %err, "dropping undecodable frame"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        sink.send(Message::Pong(data)).await.map_err(WsError::from_tungstenite)?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "server sent close");
                        return Ok(PumpExit::Disconnected);
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
