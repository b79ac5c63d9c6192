//! Connection Handle
//!
//! One duplex connection is shared by every session. Session code only ever
//! calls [`Connection::send`]; opening, closing and reconnecting belong to the
//! transport that owns the other end of the channels.

use std::fmt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::protocol::ProtocolMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

pub trait Connection: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Queue a message. Never fails: when the connection is not open the
    /// message is dropped.
    fn send(&self, message: ProtocolMessage);
}

/// Channel-backed handle; the transport drains `outbound` and drives `state`.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    outbound: mpsc::Sender<ProtocolMessage>,
    state: watch::Receiver<ConnectionState>,
}

/// The transport's end of a [`ChannelConnection`].
#[derive(Debug)]
pub struct ConnectionDriver {
    pub outbound: mpsc::Receiver<ProtocolMessage>,
    pub state: watch::Sender<ConnectionState>,
}

impl ChannelConnection {
    pub fn new(capacity: usize) -> (Self, ConnectionDriver) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        (
            Self {
                outbound: outbound_tx,
                state: state_rx,
            },
            ConnectionDriver {
                outbound: outbound_rx,
                state: state_tx,
            },
        )
    }

    /// Watch channel for callers that gate UI actions on readiness.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

impl Connection for ChannelConnection {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn send(&self, message: ProtocolMessage) {
        let state = self.state();
        if state != ConnectionState::Open {
            debug!(action = %message.action(), %state, "dropping outbound message, connection not open");
            return;
        }
        match self.outbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(action = %message.action(), "outbound queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                debug!(action = %message.action(), "transport gone, dropping message");
            }
        }
    }
}

impl ConnectionDriver {
    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Throw away everything queued while the link was down.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_while_connecting_is_dropped() {
        let (conn, mut driver) = ChannelConnection::new(4);
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.send(ProtocolMessage::Heartbeat);
        assert!(driver.outbound.try_recv().is_err());
    }

    #[test]
    fn send_while_open_is_queued() {
        let (conn, mut driver) = ChannelConnection::new(4);
        driver.set_state(ConnectionState::Open);

        conn.send(ProtocolMessage::Heartbeat);
        assert_eq!(driver.outbound.try_recv().unwrap(), ProtocolMessage::Heartbeat);
    }

    #[test]
    fn full_queue_drops_without_panicking() {
        let (conn, mut driver) = ChannelConnection::new(1);
        driver.set_state(ConnectionState::Open);

        conn.send(ProtocolMessage::Heartbeat);
        conn.send(ProtocolMessage::Heartbeat);
        assert_eq!(driver.discard_pending(), 1);
    }

    #[test]
    fn send_after_transport_dropped_is_silent() {
        let (conn, driver) = ChannelConnection::new(1);
        driver.set_state(ConnectionState::Open);
        let ConnectionDriver { outbound, state } = driver;
        drop(outbound);

        conn.send(ProtocolMessage::Heartbeat);
        drop(state);
    }

    #[test]
    fn state_is_observable() {
        let (conn, driver) = ChannelConnection::new(1);
        let watcher = conn.subscribe_state();
        driver.set_state(ConnectionState::Closed);
        assert_eq!(*watcher.borrow(), ConnectionState::Closed);
    }
}
