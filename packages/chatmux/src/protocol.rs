//! Wire protocol
//!
//! Every message on the shared connection is a JSON object of the form
//! `{ "action": "...", "data": { ... } }`. The same envelope carries outbound
//! `run` requests and inbound streaming events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{InvalidTokenError, ProtocolError};
use crate::ids::{RunId, SessionId};
use crate::metadata::{FileAttachment, TurnMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Heartbeat,
    Run,
    FinalResponse,
    LlmNewToken,
    Error,
    /// Any action tag this client does not understand.
    #[serde(other)]
    Unknown,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Heartbeat => "heartbeat",
            Action::Run => "run",
            Action::FinalResponse => "final_response",
            Action::LlmNewToken => "llm_new_token",
            Action::Error => "error",
            Action::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Chain,
    ImageGeneration,
    VideoGeneration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelKwargs {
    pub streaming: bool,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for ModelKwargs {
    fn default() -> Self {
        Self {
            streaming: true,
            max_tokens: 512,
            temperature: 0.6,
            top_p: 0.9,
        }
    }
}

/// Outbound `run` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub session_id: SessionId,
    pub model_name: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_kwargs: Option<ModelKwargs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileAttachment>,
}

/// A token exactly as it arrived. The sequence number is kept as raw JSON so a
/// malformed value can be rejected per token instead of failing the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireToken {
    #[serde(default)]
    pub sequence_number: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub value: String,
}

impl WireToken {
    pub fn new(sequence_number: u64, run_id: Option<&str>, value: impl Into<String>) -> Self {
        Self {
            sequence_number: Value::from(sequence_number),
            run_id: run_id.map(RunId::from),
            value: value.into(),
        }
    }
}

/// One validated fragment of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub sequence_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub value: String,
}

impl Token {
    pub fn new(sequence_number: u64, run_id: Option<&str>, value: impl Into<String>) -> Self {
        Self {
            sequence_number,
            run_id: run_id.map(RunId::from),
            value: value.into(),
        }
    }
}

impl TryFrom<&WireToken> for Token {
    type Error = InvalidTokenError;

    fn try_from(wire: &WireToken) -> Result<Self, Self::Error> {
        let sequence_number = match &wire.sequence_number {
            Value::Number(n) => {
                if let Some(seq) = n.as_u64() {
                    seq
                } else if n.as_i64().is_some() {
                    return Err(InvalidTokenError::new(format!(
                        "negative sequence number {n}"
                    )));
                } else {
                    match n.as_f64() {
                        Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => {
                            f as u64
                        }
                        _ => {
                            return Err(InvalidTokenError::new(format!(
                                "sequence number {n} is not a non-negative integer"
                            )));
                        }
                    }
                }
            }
            Value::Null => return Err(InvalidTokenError::new("missing sequence number")),
            other => {
                return Err(InvalidTokenError::new(format!(
                    "non-numeric sequence number {other}"
                )));
            }
        };
        Ok(Token {
            sequence_number,
            run_id: wire.run_id.clone(),
            value: wire.value.clone(),
        })
    }
}

/// Inbound `llm_new_token` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<WireToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TurnMetadata>,
}

/// Inbound `final_response` / `error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TurnMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<WireToken>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Heartbeat,
    Run(RunRequest),
    LlmNewToken(TokenPayload),
    FinalResponse(ResponsePayload),
    Error(ResponsePayload),
    /// Carried through so the router can log it; never acted upon.
    Unknown,
}

#[derive(Deserialize)]
struct Envelope {
    action: Action,
    #[serde(default)]
    data: Value,
}

impl ProtocolMessage {
    pub fn action(&self) -> Action {
        match self {
            ProtocolMessage::Heartbeat => Action::Heartbeat,
            ProtocolMessage::Run(_) => Action::Run,
            ProtocolMessage::LlmNewToken(_) => Action::LlmNewToken,
            ProtocolMessage::FinalResponse(_) => Action::FinalResponse,
            ProtocolMessage::Error(_) => Action::Error,
            ProtocolMessage::Unknown => Action::Unknown,
        }
    }

    /// The session this message belongs to, if it is session-scoped.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            ProtocolMessage::Run(req) => Some(&req.session_id),
            ProtocolMessage::LlmNewToken(payload) => Some(&payload.session_id),
            ProtocolMessage::FinalResponse(payload) | ProtocolMessage::Error(payload) => {
                Some(&payload.session_id)
            }
            ProtocolMessage::Heartbeat | ProtocolMessage::Unknown => None,
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let action = envelope.action;
        let data = envelope.data;
        let payload_err = |source: serde_json::Error| ProtocolError::InvalidPayload {
            action: action.as_str(),
            source,
        };
        Ok(match action {
            Action::Heartbeat => ProtocolMessage::Heartbeat,
            Action::Unknown => ProtocolMessage::Unknown,
            Action::Run => ProtocolMessage::Run(serde_json::from_value(data).map_err(payload_err)?),
            Action::LlmNewToken => {
                ProtocolMessage::LlmNewToken(serde_json::from_value(data).map_err(payload_err)?)
            }
            Action::FinalResponse => {
                ProtocolMessage::FinalResponse(serde_json::from_value(data).map_err(payload_err)?)
            }
            Action::Error => {
                ProtocolMessage::Error(serde_json::from_value(data).map_err(payload_err)?)
            }
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let data = match self {
            ProtocolMessage::Heartbeat | ProtocolMessage::Unknown => None,
            ProtocolMessage::Run(req) => Some(serde_json::to_value(req)?),
            ProtocolMessage::LlmNewToken(payload) => Some(serde_json::to_value(payload)?),
            ProtocolMessage::FinalResponse(payload) | ProtocolMessage::Error(payload) => {
                Some(serde_json::to_value(payload)?)
            }
        };
        let mut envelope = serde_json::Map::new();
        envelope.insert("action".to_string(), Value::from(self.action().as_str()));
        if let Some(data) = data {
            envelope.insert("data".to_string(), data);
        }
        Ok(serde_json::to_string(&Value::Object(envelope))?)
    }
}
