//! Token Reconciler
//!
//! Folds streamed token events for one AI turn into display text.
//!
//! # Rules
//!
//! 1. An explicit `content` string on the event is authoritative and shown verbatim.
//! 2. Otherwise the buffer, with the new token appended, is stably sorted by
//!    sequence number.
//! 3. Stale-run fencing keeps only the run that owns the highest sequence number
//!    (ties go to the greatest run id). Tokens without a run id form their own
//!    bucket and are never fenced against keyed tokens.
//! 4. Display text is the contiguous prefix of the display bucket: values are
//!    concatenated while each sequence number is the previous one plus 1. Tokens
//!    past a gap stay buffered until the gap fills.
//!
//! Everything here is pure; the Session Controller owns the state.

use crate::error::InvalidTokenError;
use crate::ids::RunId;
use crate::metadata::TurnMetadata;
use crate::protocol::{ResponsePayload, Token, TokenPayload, WireToken};

/// The part of an inbound event the reconciler cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentUpdate {
    pub token: Option<WireToken>,
    pub content: Option<String>,
    pub metadata: Option<TurnMetadata>,
}

impl ContentUpdate {
    pub fn token(token: WireToken) -> Self {
        Self {
            token: Some(token),
            ..Default::default()
        }
    }

    /// The same update with its token removed, used after a token is rejected.
    pub fn without_token(&self) -> Self {
        Self {
            token: None,
            content: self.content.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl From<&TokenPayload> for ContentUpdate {
    fn from(payload: &TokenPayload) -> Self {
        Self {
            token: payload.token.clone(),
            content: payload.content.clone(),
            metadata: payload.metadata.clone(),
        }
    }
}

impl From<&ResponsePayload> for ContentUpdate {
    fn from(payload: &ResponsePayload) -> Self {
        Self {
            token: payload.token.clone(),
            content: payload.content.clone(),
            metadata: payload.metadata.clone(),
        }
    }
}

/// New state for the trailing AI turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub content: String,
    pub metadata: TurnMetadata,
    /// Fenced and sorted, including tokens buffered past a gap.
    pub tokens: Vec<Token>,
}

pub fn reconcile(
    current: &[Token],
    previous_metadata: &TurnMetadata,
    update: &ContentUpdate,
) -> Result<Reconciled, InvalidTokenError> {
    let incoming = update.token.as_ref().map(Token::try_from).transpose()?;

    let mut tokens = current.to_vec();
    if let Some(token) = incoming {
        let duplicate = tokens
            .iter()
            .any(|t| t.sequence_number == token.sequence_number && t.run_id == token.run_id);
        if !duplicate {
            tokens.push(token);
        }
    }

    // sort_by_key is stable, so equal sequence numbers keep arrival order
    tokens.sort_by_key(|t| t.sequence_number);
    let tokens = fence_stale_runs(tokens);

    let content = match &update.content {
        Some(explicit) => explicit.clone(),
        None => assemble_prefix(&tokens),
    };

    let metadata = match &update.metadata {
        Some(incoming) => previous_metadata.merge(incoming),
        None => previous_metadata.clone(),
    };

    Ok(Reconciled {
        content,
        metadata,
        tokens,
    })
}

/// The run owning the highest keyed sequence number; ties go to the greatest id.
pub fn current_run(tokens: &[Token]) -> Option<&RunId> {
    tokens
        .iter()
        .filter_map(|t| t.run_id.as_ref().map(|run| (t.sequence_number, run)))
        .max()
        .map(|(_, run)| run)
}

fn fence_stale_runs(tokens: Vec<Token>) -> Vec<Token> {
    let Some(winner) = current_run(&tokens).cloned() else {
        return tokens;
    };
    tokens
        .into_iter()
        .filter(|t| match &t.run_id {
            Some(run) => *run == winner,
            None => true,
        })
        .collect()
}

/// Concatenate the contiguous run of sequence numbers starting at the first token.
fn assemble_prefix(tokens: &[Token]) -> String {
    let keyed = tokens.iter().any(|t| t.run_id.is_some());
    let mut bucket = tokens.iter().filter(|t| t.run_id.is_some() == keyed);

    let Some(first) = bucket.next() else {
        return String::new();
    };
    let mut content = first.value.clone();
    let mut last = first.sequence_number;
    for token in bucket {
        if Some(token.sequence_number) != last.checked_add(1) {
            break;
        }
        content.push_str(&token.value);
        last = token.sequence_number;
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(tokens: &[Token], wire: WireToken) -> Reconciled {
        reconcile(tokens, &TurnMetadata::default(), &ContentUpdate::token(wire)).unwrap()
    }

    fn feed(wires: Vec<WireToken>) -> Reconciled {
        let mut state = Reconciled {
            content: String::new(),
            metadata: TurnMetadata::default(),
            tokens: Vec::new(),
        };
        for wire in wires {
            state = apply(&state.tokens, wire);
        }
        state
    }

    #[test]
    fn in_order_tokens_concatenate() {
        let state = feed(vec![
            WireToken::new(0, Some("r1"), "Hi"),
            WireToken::new(1, Some("r1"), " there"),
        ]);
        assert_eq!(state.content, "Hi there");
        assert_eq!(state.tokens.len(), 2);
    }

    #[test]
    fn out_of_order_tokens_are_sorted() {
        let state = feed(vec![
            WireToken::new(2, Some("r1"), "c"),
            WireToken::new(0, Some("r1"), "a"),
            WireToken::new(1, Some("r1"), "b"),
        ]);
        assert_eq!(state.content, "abc");
    }

    #[test]
    fn gap_stops_assembly_but_keeps_buffer() {
        let state = feed(vec![
            WireToken::new(1, Some("r1"), "one "),
            WireToken::new(2, Some("r1"), "two "),
            WireToken::new(4, Some("r1"), "four"),
        ]);
        assert_eq!(state.content, "one two ");
        assert_eq!(state.tokens.len(), 3);

        let filled = apply(&state.tokens, WireToken::new(3, Some("r1"), "three "));
        assert_eq!(filled.content, "one two three four");
    }

    #[test]
    fn newer_run_supersedes_older_in_either_order() {
        let ab = feed(vec![
            WireToken::new(1, Some("A"), "x"),
            WireToken::new(1, Some("B"), "y"),
        ]);
        let ba = feed(vec![
            WireToken::new(1, Some("B"), "y"),
            WireToken::new(1, Some("A"), "x"),
        ]);
        assert_eq!(ab.content, "y");
        assert_eq!(ba.content, "y");
        assert!(ab.tokens.iter().all(|t| t.run_id == Some(RunId::from("B"))));
    }

    #[test]
    fn run_with_highest_sequence_wins() {
        let state = feed(vec![
            WireToken::new(0, Some("r1"), "old0"),
            WireToken::new(1, Some("r1"), "old1"),
            WireToken::new(2, Some("r2"), "new2"),
        ]);
        assert_eq!(state.tokens.len(), 1);
        assert_eq!(state.content, "new2");
    }

    #[test]
    fn unkeyed_tokens_are_their_own_bucket() {
        let state = feed(vec![
            WireToken::new(0, None, "legacy"),
            WireToken::new(1, None, " stream"),
        ]);
        assert_eq!(state.content, "legacy stream");

        let mixed = apply(&state.tokens, WireToken::new(0, Some("r1"), "keyed"));
        // keyed bucket displays; unkeyed tokens are retained, not fenced
        assert_eq!(mixed.content, "keyed");
        assert_eq!(mixed.tokens.len(), 3);
    }

    #[test]
    fn duplicate_delivery_is_ignored() {
        let state = feed(vec![
            WireToken::new(0, Some("r1"), "a"),
            WireToken::new(0, Some("r1"), "a"),
            WireToken::new(1, Some("r1"), "b"),
        ]);
        assert_eq!(state.content, "ab");
        assert_eq!(state.tokens.len(), 2);
    }

    #[test]
    fn explicit_content_is_authoritative() {
        let tokens = vec![Token::new(0, Some("r1"), "Hi")];
        let update = ContentUpdate {
            token: Some(WireToken::new(1, Some("r1"), " there")),
            content: Some("Hi there!".to_string()),
            metadata: None,
        };
        let state = reconcile(&tokens, &TurnMetadata::default(), &update).unwrap();
        assert_eq!(state.content, "Hi there!");
        assert_eq!(state.tokens.len(), 2);
    }

    #[test]
    fn metadata_is_retained_when_absent() {
        let mut previous = TurnMetadata::default();
        previous.extra.insert("modelId".to_string(), json!("m1"));

        let state = reconcile(
            &[],
            &previous,
            &ContentUpdate::token(WireToken::new(0, None, "x")),
        )
        .unwrap();
        assert_eq!(state.metadata, previous);
    }

    #[test]
    fn invalid_token_is_reported() {
        let mut wire = WireToken::new(0, Some("r1"), "x");
        wire.sequence_number = json!(-3);
        let err = reconcile(&[], &TurnMetadata::default(), &ContentUpdate::token(wire)).unwrap_err();
        assert_eq!(err.error_code(), "invalid_token");
    }

    #[test]
    fn empty_buffer_renders_empty() {
        let state = reconcile(&[], &TurnMetadata::default(), &ContentUpdate::default()).unwrap();
        assert_eq!(state.content, "");
        assert!(state.tokens.is_empty());
    }
}
