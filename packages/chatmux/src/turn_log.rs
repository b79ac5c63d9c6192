use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::TurnLogError;
use crate::metadata::TurnMetadata;
use crate::protocol::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Human,
    #[serde(rename = "AI")]
    Ai,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" | "user" => Ok(Role::Human),
            "ai" | "assistant" => Ok(Role::Ai),
            _ => Err(format!("Invalid turn role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: TurnMetadata,
    /// Streaming buffer; only meaningful on the in-flight AI turn.
    #[serde(skip)]
    pub tokens: Vec<Token>,
}

impl Turn {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            content: content.into(),
            metadata: TurnMetadata::default(),
            tokens: Vec::new(),
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self {
            role: Role::Ai,
            content: content.into(),
            metadata: TurnMetadata::default(),
            tokens: Vec::new(),
        }
    }

    pub fn is_ai(&self) -> bool {
        self.role == Role::Ai
    }
}

/// Ordered, append-only Human/AI turns of one session.
///
/// The only in-place mutation allowed is replacing the trailing AI turn's
/// content, metadata and token buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnLog {
    turns: Vec<Turn>,
}

impl TurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a persisted history; token buffers are never persisted.
    pub fn from_history(turns: Vec<Turn>) -> Self {
        let turns = turns
            .into_iter()
            .map(|mut turn| {
                turn.tokens.clear();
                turn
            })
            .collect();
        Self { turns }
    }

    pub fn append_human_and_placeholder(&mut self, text: &str) {
        self.append_human_with_metadata(text, TurnMetadata::default());
    }

    pub fn append_human_with_metadata(&mut self, text: &str, metadata: TurnMetadata) {
        self.turns.push(Turn {
            metadata,
            ..Turn::human(text)
        });
        self.turns.push(Turn::ai(""));
    }

    pub fn replace_trailing_ai(
        &mut self,
        content: String,
        metadata: TurnMetadata,
        tokens: Vec<Token>,
    ) -> Result<(), TurnLogError> {
        let turn = self
            .turns
            .last_mut()
            .filter(|t| t.is_ai())
            .ok_or(TurnLogError::NoTrailingAiTurn)?;
        turn.content = content;
        turn.metadata = metadata;
        turn.tokens = tokens;
        Ok(())
    }

    pub fn trailing_ai(&self) -> Option<&Turn> {
        self.turns.last().filter(|t| t.is_ai())
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
