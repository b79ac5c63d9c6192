//! # chatmux
//!
//! Client-side reconciliation for streamed LLM chat sessions that share one
//! duplex connection.
//!
//! ## Overview
//!
//! A backend streams `llm_new_token` events that may arrive out of order, from
//! retried runs, or interleaved with other sessions. This crate turns them into a
//! stable transcript:
//! - [`reconcile`] folds tokens for one AI turn into display text
//! - [`TurnLog`] holds the append-only Human/AI turns of a session
//! - [`SessionController`] drives one session's `Idle`/`Running` state machine
//! - [`SessionRegistry`] routes inbound messages by `sessionId` and fans a prompt
//!   out to many sessions
//! - [`Connection`] is the shared outbound handle; the `websocket` feature adds a
//!   tokio-tungstenite transport in [`ws`]
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use chatmux::{ChannelConnection, ConnectionState, ProtocolMessage, RunOptions, SessionRegistry};
//!
//! let (connection, driver) = ChannelConnection::new(16);
//! driver.set_state(ConnectionState::Open);
//!
//! let mut registry = SessionRegistry::new(Arc::new(connection));
//! let session = registry.create_session(None, RunOptions::with_model("bedrock", "claude"));
//! let id = session.id().clone();
//! let options = session.options().clone();
//! session.start_run("hello", options).unwrap();
//!
//! let text = format!(
//!     r#"{{"action":"final_response","data":{{"sessionId":"{id}","content":"Hi!"}}}}"#
//! );
//! registry.dispatch(&ProtocolMessage::decode(&text).unwrap());
//! assert_eq!(registry.get(&id).unwrap().snapshot()[1].content, "Hi!");
//! ```

pub mod collaborators;
pub mod connection;
pub mod error;
pub mod ids;
pub mod metadata;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod turn_log;
pub mod view;
#[cfg(feature = "websocket")]
pub mod ws;

pub use collaborators::{Catalog, HistorySource, ModelDescriptor, StaticCatalog, WorkspaceDescriptor};
pub use connection::{ChannelConnection, Connection, ConnectionDriver, ConnectionState};
pub use error::{CollaboratorError, InvalidTokenError, ProtocolError, SessionError, TurnLogError};
pub use ids::{RunId, SessionId};
pub use metadata::{Document, FileAttachment, TurnMetadata};
pub use protocol::{
    Action, Mode, ModelKwargs, ProtocolMessage, ResponsePayload, RunRequest, Token, TokenPayload,
    WireToken,
};
pub use reconciler::{ContentUpdate, Reconciled, reconcile};
pub use registry::SessionRegistry;
pub use session::{ModelSelection, RunOptions, RunState, SessionController, SessionEvent};
pub use turn_log::{Role, Turn, TurnLog};
pub use view::ScrollCoordinator;
