//! Session Controller
//!
//! One controller per logical chat session. It owns the session's [`TurnLog`]
//! and run state, and drives this state machine:
//!
//! - `Idle -> Running` on [`SessionController::start_run`]
//! - `Running -> Running` on `llm_new_token`
//! - `Running -> Idle` on `final_response` or `error`
//!
//! Events for other sessions, and streaming events that arrive while idle, are
//! dropped. There is no timeout: a run whose connection died stays `Running`
//! until the caller calls [`SessionController::reset`].

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::collaborators::HistorySource;
use crate::connection::Connection;
use crate::error::{InvalidTokenError, SessionError, TurnLogError};
use crate::ids::{RunId, SessionId};
use crate::metadata::{FileAttachment, TurnMetadata};
use crate::protocol::{ModelKwargs, Mode, ProtocolMessage, ResponsePayload, RunRequest, TokenPayload};
use crate::reconciler::{ContentUpdate, Reconciled, current_run, reconcile};
use crate::turn_log::{Turn, TurnLog};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub provider: String,
    pub name: String,
}

impl ModelSelection {
    pub fn new(provider: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ModelSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

/// Everything a `run` request needs besides the prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub model: Option<ModelSelection>,
    pub workspace_id: Option<String>,
    pub mode: Mode,
    pub model_kwargs: Option<ModelKwargs>,
    pub files: Vec<FileAttachment>,
}

impl RunOptions {
    pub fn with_model(provider: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            model: Some(ModelSelection::new(provider, name)),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running,
}

/// What a controller reports back to its owner after handling input.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started {
        session_id: SessionId,
    },
    ContentUpdated {
        session_id: SessionId,
        content: String,
    },
    Completed {
        session_id: SessionId,
        content: String,
        metadata: TurnMetadata,
    },
    /// The backend answered with an `error` action; `content` is shown as the AI turn.
    Failed {
        session_id: SessionId,
        content: String,
        metadata: TurnMetadata,
    },
    TokenRejected {
        session_id: SessionId,
        error: InvalidTokenError,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::Started { session_id }
            | SessionEvent::ContentUpdated { session_id, .. }
            | SessionEvent::Completed { session_id, .. }
            | SessionEvent::Failed { session_id, .. }
            | SessionEvent::TokenRejected { session_id, .. } => session_id,
        }
    }
}

/// How many superseded run ids a session remembers.
const MAX_RETIRED_RUNS: usize = 32;

pub struct SessionController {
    id: SessionId,
    state: RunState,
    loading: bool,
    log: TurnLog,
    options: RunOptions,
    /// Newest run seen on the trailing AI turn.
    active_run: Option<RunId>,
    /// Runs that belonged to earlier turns, oldest first. Any event carrying
    /// one of their tokens is discarded.
    retired_runs: VecDeque<RunId>,
    connection: Arc<dyn Connection>,
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("loading", &self.loading)
            .field("turns", &self.log.len())
            .field("active_run", &self.active_run)
            .finish_non_exhaustive()
    }
}

impl SessionController {
    pub fn new(id: SessionId, options: RunOptions, connection: Arc<dyn Connection>) -> Self {
        Self {
            id,
            state: RunState::Idle,
            loading: false,
            log: TurnLog::new(),
            options,
            active_run: None,
            retired_runs: VecDeque::new(),
            connection,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn turn_log(&self) -> &TurnLog {
        &self.log
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.log.snapshot()
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: RunOptions) {
        self.options = options;
    }

    pub fn active_run(&self) -> Option<&RunId> {
        self.active_run.as_ref()
    }

    /// Send `prompt` as a new run. The options become this session's defaults.
    pub fn start_run(
        &mut self,
        prompt: &str,
        options: RunOptions,
    ) -> Result<SessionEvent, SessionError> {
        if self.is_running() {
            return Err(SessionError::AlreadyRunning {
                session_id: self.id.to_string(),
            });
        }
        if self.loading {
            return Err(SessionError::NotIdle {
                session_id: self.id.to_string(),
                operation: "start a run",
            });
        }
        if prompt.trim().is_empty() {
            return Err(SessionError::EmptyPrompt);
        }
        let model = options
            .model
            .clone()
            .ok_or_else(|| SessionError::MissingModel {
                session_id: self.id.to_string(),
            })?;

        self.retire_trailing_runs();

        let human_metadata = if options.files.is_empty() {
            TurnMetadata::default()
        } else {
            TurnMetadata::with_files(options.files.clone())
        };
        self.log.append_human_with_metadata(prompt, human_metadata);

        self.connection.send(ProtocolMessage::Run(RunRequest {
            session_id: self.id.clone(),
            model_name: model.name.clone(),
            provider: model.provider.clone(),
            workspace_id: options.workspace_id.clone(),
            text: prompt.to_string(),
            mode: options.mode,
            model_kwargs: options.model_kwargs.clone(),
            files: options.files.clone(),
        }));

        self.state = RunState::Running;
        self.options = options;
        info!(session_id = %self.id, %model, "run started");
        Ok(SessionEvent::Started {
            session_id: self.id.clone(),
        })
    }

    /// Apply one inbound message addressed to this session.
    pub fn handle_event(&mut self, message: &ProtocolMessage) -> Vec<SessionEvent> {
        let Some(target) = message.session_id() else {
            return Vec::new();
        };
        if *target != self.id {
            debug!(session_id = %self.id, target = %target, "dropping misrouted message");
            return Vec::new();
        }

        match message {
            ProtocolMessage::LlmNewToken(payload) => self.on_token(payload),
            ProtocolMessage::FinalResponse(payload) => self.on_terminal(payload, false),
            ProtocolMessage::Error(payload) => self.on_terminal(payload, true),
            ProtocolMessage::Heartbeat | ProtocolMessage::Run(_) | ProtocolMessage::Unknown => {
                Vec::new()
            }
        }
    }

    /// Force the session back to `Idle`, abandoning any run in flight.
    ///
    /// Returns whether a run was abandoned.
    pub fn reset(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.retire_trailing_runs();
        self.state = RunState::Idle;
        warn!(session_id = %self.id, "run abandoned by reset");
        true
    }

    pub fn begin_loading(&mut self) -> Result<(), SessionError> {
        if self.is_running() || self.loading {
            return Err(SessionError::NotIdle {
                session_id: self.id.to_string(),
                operation: "load history",
            });
        }
        if !self.log.is_empty() {
            return Err(TurnLogError::NotEmpty {
                len: self.log.len(),
            }
            .into());
        }
        self.loading = true;
        Ok(())
    }

    pub fn finish_loading(&mut self, history: Option<Vec<Turn>>) {
        if let Some(turns) = history {
            self.log = TurnLog::from_history(turns);
        }
        self.loading = false;
        debug!(session_id = %self.id, turns = self.log.len(), "history loaded");
    }

    /// Fetch persisted history and hydrate the log. Returns the number of turns loaded.
    pub async fn hydrate<H: HistorySource>(&mut self, source: &H) -> Result<usize, SessionError> {
        self.begin_loading()?;
        match source.fetch_persisted_history(&self.id).await {
            Ok(history) => {
                self.finish_loading(history);
                Ok(self.log.len())
            }
            Err(err) => {
                self.loading = false;
                warn!(session_id = %self.id, error = %err, "history fetch failed");
                Err(err.into())
            }
        }
    }

    fn on_token(&mut self, payload: &TokenPayload) -> Vec<SessionEvent> {
        if !self.is_running() {
            debug!(session_id = %self.id, "dropping token for idle session");
            return Vec::new();
        }
        if self.is_retired(payload.token.as_ref().and_then(|t| t.run_id.as_ref())) {
            return Vec::new();
        }
        let update = ContentUpdate::from(payload);
        if update.token.is_none() && update.content.is_none() && update.metadata.is_none() {
            return Vec::new();
        }

        let mut events = Vec::new();
        if let Some(reconciled) = self.apply(&update, &mut events) {
            events.push(SessionEvent::ContentUpdated {
                session_id: self.id.clone(),
                content: reconciled.content,
            });
        }
        events
    }

    fn on_terminal(&mut self, payload: &ResponsePayload, failed: bool) -> Vec<SessionEvent> {
        if !self.is_running() {
            debug!(session_id = %self.id, failed, "dropping terminal event for idle session");
            return Vec::new();
        }
        if self.is_retired(payload.token.as_ref().and_then(|t| t.run_id.as_ref())) {
            return Vec::new();
        }
        let update = ContentUpdate::from(payload);

        let mut events = Vec::new();
        let reconciled = self.apply(&update, &mut events);
        self.state = RunState::Idle;

        let Some(reconciled) = reconciled else {
            return events;
        };
        if failed {
            warn!(session_id = %self.id, content = %reconciled.content, "backend reported an error");
            events.push(SessionEvent::Failed {
                session_id: self.id.clone(),
                content: reconciled.content,
                metadata: reconciled.metadata,
            });
        } else {
            info!(session_id = %self.id, chars = reconciled.content.len(), "run completed");
            events.push(SessionEvent::Completed {
                session_id: self.id.clone(),
                content: reconciled.content,
                metadata: reconciled.metadata,
            });
        }
        events
    }

    fn is_retired(&self, run: Option<&RunId>) -> bool {
        let Some(run) = run else {
            return false;
        };
        let retired = self.retired_runs.contains(run);
        if retired {
            debug!(session_id = %self.id, run_id = %run, "dropping event from a superseded run");
        }
        retired
    }

    /// Reconcile against the trailing AI turn and write the result back.
    fn apply(&mut self, update: &ContentUpdate, events: &mut Vec<SessionEvent>) -> Option<Reconciled> {
        let Some(trailing) = self.log.trailing_ai() else {
            error!(session_id = %self.id, "running session has no trailing AI turn");
            return None;
        };

        let reconciled = match reconcile(&trailing.tokens, &trailing.metadata, update) {
            Ok(reconciled) => reconciled,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "dropping invalid token");
                events.push(SessionEvent::TokenRejected {
                    session_id: self.id.clone(),
                    error: err,
                });
                reconcile(&trailing.tokens, &trailing.metadata, &update.without_token()).ok()?
            }
        };

        if let Err(err) = self.log.replace_trailing_ai(
            reconciled.content.clone(),
            reconciled.metadata.clone(),
            reconciled.tokens.clone(),
        ) {
            error!(session_id = %self.id, error = %err, "turn log contract violated");
            return None;
        }
        self.active_run = current_run(&reconciled.tokens).cloned();
        Some(reconciled)
    }

    fn retire_trailing_runs(&mut self) {
        let mut runs: Vec<RunId> = self.active_run.take().into_iter().collect();
        if let Some(trailing) = self.log.trailing_ai() {
            runs.extend(trailing.tokens.iter().filter_map(|t| t.run_id.clone()));
        }
        for run in runs {
            if self.retired_runs.contains(&run) {
                continue;
            }
            if self.retired_runs.len() == MAX_RETIRED_RUNS {
                self.retired_runs.pop_front();
            }
            self.retired_runs.push_back(run);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ChannelConnection, ConnectionDriver, ConnectionState};
    use crate::protocol::WireToken;
    use crate::turn_log::Role;

    fn open_session(id: &str) -> (SessionController, ConnectionDriver) {
        let (conn, driver) = ChannelConnection::new(16);
        driver.set_state(ConnectionState::Open);
        let session = SessionController::new(
            SessionId::new(id),
            RunOptions::with_model("bedrock", "claude"),
            Arc::new(conn),
        );
        (session, driver)
    }

    fn token(session: &str, seq: u64, run: &str, value: &str) -> ProtocolMessage {
        ProtocolMessage::LlmNewToken(TokenPayload {
            session_id: SessionId::new(session),
            token: Some(WireToken::new(seq, Some(run), value)),
            content: None,
            metadata: None,
        })
    }

    fn final_response(session: &str, content: &str) -> ProtocolMessage {
        ProtocolMessage::FinalResponse(ResponsePayload {
            session_id: SessionId::new(session),
            content: Some(content.to_string()),
            metadata: None,
            token: None,
        })
    }

    #[test]
    fn start_run_appends_pair_and_sends_run() {
        let (mut session, mut driver) = open_session("s1");
        let options = session.options().clone();
        session.start_run("hello", options).unwrap();

        assert!(session.is_running());
        let turns = session.snapshot();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::Human);
        assert_eq!(turns[1].role, Role::Ai);

        let ProtocolMessage::Run(req) = driver.outbound.try_recv().unwrap() else {
            panic!("expected run");
        };
        assert_eq!(req.session_id.as_str(), "s1");
        assert_eq!(req.text, "hello");
        assert_eq!(req.provider, "bedrock");
    }

    #[test]
    fn start_run_rejects_concurrent_runs() {
        let (mut session, _driver) = open_session("s1");
        let options = session.options().clone();
        session.start_run("one", options.clone()).unwrap();

        let err = session.start_run("two", options).unwrap_err();
        assert_eq!(err.error_code(), "already_running");
        assert_eq!(session.turn_log().len(), 2);
    }

    #[test]
    fn start_run_requires_model_and_prompt() {
        let (mut session, _driver) = open_session("s1");
        assert_eq!(
            session.start_run("hi", RunOptions::default()).unwrap_err(),
            SessionError::MissingModel {
                session_id: "s1".to_string()
            }
        );
        let options = session.options().clone();
        assert_eq!(
            session.start_run("   ", options).unwrap_err(),
            SessionError::EmptyPrompt
        );
        assert!(session.turn_log().is_empty());
    }

    #[test]
    fn tokens_then_final_response() {
        let (mut session, _driver) = open_session("s1");
        let options = session.options().clone();
        session.start_run("hello", options).unwrap();

        session.handle_event(&token("s1", 0, "r1", "Hi"));
        let events = session.handle_event(&token("s1", 1, "r1", " there"));
        assert_eq!(
            events,
            vec![SessionEvent::ContentUpdated {
                session_id: SessionId::new("s1"),
                content: "Hi there".to_string()
            }]
        );

        let events = session.handle_event(&final_response("s1", "Hi there!"));
        assert!(matches!(events[0], SessionEvent::Completed { ref content, .. } if content == "Hi there!"));
        assert!(!session.is_running());
        assert_eq!(session.snapshot()[1].content, "Hi there!");
    }

    #[test]
    fn tokens_after_final_response_are_ignored() {
        let (mut session, _driver) = open_session("s1");
        let options = session.options().clone();
        session.start_run("hello", options).unwrap();
        session.handle_event(&final_response("s1", "done"));

        assert!(session.handle_event(&token("s1", 9, "r1", "late")).is_empty());
        assert!(session.handle_event(&final_response("s1", "again")).is_empty());
        assert_eq!(session.snapshot()[1].content, "done");
    }

    #[test]
    fn mismatched_session_id_is_dropped() {
        let (mut session, _driver) = open_session("s1");
        let options = session.options().clone();
        session.start_run("hello", options).unwrap();

        assert!(session.handle_event(&token("s2", 0, "r1", "nope")).is_empty());
        assert_eq!(session.snapshot()[1].content, "");
    }

    #[test]
    fn error_action_becomes_terminal_turn() {
        let (mut session, _driver) = open_session("s1");
        let options = session.options().clone();
        session.start_run("hello", options).unwrap();

        let events = session.handle_event(&ProtocolMessage::Error(ResponsePayload {
            session_id: SessionId::new("s1"),
            content: Some("model unavailable".to_string()),
            metadata: None,
            token: None,
        }));
        assert!(matches!(events[0], SessionEvent::Failed { .. }));
        assert!(!session.is_running());
        assert_eq!(session.snapshot()[1].content, "model unavailable");
    }

    #[test]
    fn error_carries_merged_metadata() {
        let (mut session, _driver) = open_session("s1");
        let options = session.options().clone();
        session.start_run("hello", options).unwrap();

        let mut streamed = TurnMetadata::default();
        streamed.extra.insert("traceId".to_string(), serde_json::json!("t-1"));
        session.handle_event(&ProtocolMessage::LlmNewToken(TokenPayload {
            session_id: SessionId::new("s1"),
            token: Some(WireToken::new(0, Some("r1"), "Hi")),
            content: None,
            metadata: Some(streamed),
        }));

        let mut terminal = TurnMetadata::default();
        terminal.extra.insert("modelId".to_string(), serde_json::json!("m"));
        let events = session.handle_event(&ProtocolMessage::Error(ResponsePayload {
            session_id: SessionId::new("s1"),
            content: Some("quota exceeded".to_string()),
            metadata: Some(terminal),
            token: None,
        }));

        let [SessionEvent::Failed { metadata, .. }] = events.as_slice() else {
            panic!("expected one failure, got {events:?}");
        };
        assert_eq!(metadata.extra.get("traceId"), Some(&serde_json::json!("t-1")));
        assert_eq!(metadata.extra.get("modelId"), Some(&serde_json::json!("m")));
        assert_eq!(&session.snapshot()[1].metadata, metadata);
    }

    #[test]
    fn invalid_token_is_dropped_and_reported() {
        let (mut session, _driver) = open_session("s1");
        let options = session.options().clone();
        session.start_run("hello", options).unwrap();
        session.handle_event(&token("s1", 0, "r1", "ok"));

        let mut bad = WireToken::new(0, Some("r1"), "bad");
        bad.sequence_number = serde_json::json!("x");
        let events = session.handle_event(&ProtocolMessage::LlmNewToken(TokenPayload {
            session_id: SessionId::new("s1"),
            token: Some(bad),
            content: None,
            metadata: None,
        }));

        assert!(matches!(events[0], SessionEvent::TokenRejected { .. }));
        assert!(matches!(events[1], SessionEvent::ContentUpdated { ref content, .. } if content == "ok"));
        assert!(session.is_running());
    }

    #[test]
    fn reset_retires_the_abandoned_run() {
        let (mut session, _driver) = open_session("s1");
        let options = session.options().clone();
        session.start_run("first", options.clone()).unwrap();
        session.handle_event(&token("s1", 0, "r1", "partial"));

        assert!(session.reset());
        assert!(!session.is_running());
        assert!(!session.reset());

        session.start_run("second", options).unwrap();
        session.handle_event(&token("s1", 5, "r1", "stale"));
        assert_eq!(session.snapshot()[3].content, "");

        session.handle_event(&token("s1", 0, "r2", "fresh"));
        assert_eq!(session.snapshot()[3].content, "fresh");
        assert_eq!(session.active_run(), Some(&RunId::from("r2")));
        // the abandoned turn keeps whatever it had
        assert_eq!(session.snapshot()[1].content, "partial");
    }

    #[test]
    fn superseded_run_events_are_dropped_whole() {
        let (mut session, _driver) = open_session("s1");
        let options = session.options().clone();
        session.start_run("first", options.clone()).unwrap();
        session.handle_event(&token("s1", 0, "r1", "partial"));
        session.reset();
        session.start_run("second", options).unwrap();
        session.handle_event(&token("s1", 0, "r2", "new"));

        let late = session.handle_event(&ProtocolMessage::LlmNewToken(TokenPayload {
            session_id: SessionId::new("s1"),
            token: Some(WireToken::new(5, Some("r1"), "old")),
            content: Some("old answer".to_string()),
            metadata: None,
        }));
        assert!(late.is_empty());

        let done = session.handle_event(&ProtocolMessage::FinalResponse(ResponsePayload {
            session_id: SessionId::new("s1"),
            content: Some("old final".to_string()),
            metadata: None,
            token: Some(WireToken::new(1, Some("r1"), "x")),
        }));
        assert!(done.is_empty());
        assert!(session.is_running());
        assert_eq!(session.snapshot()[3].content, "new");
    }

    #[test]
    fn retired_runs_stay_bounded() {
        let (mut session, _driver) = open_session("s1");
        let options = session.options().clone();
        for n in 0..(MAX_RETIRED_RUNS + 10) {
            session.start_run("again", options.clone()).unwrap();
            session.handle_event(&token("s1", 0, &format!("r{n}"), "x"));
            session.reset();
        }
        assert_eq!(session.retired_runs.len(), MAX_RETIRED_RUNS);
        assert!(!session.retired_runs.contains(&RunId::from("r0")));
        let newest = RunId::from(format!("r{}", MAX_RETIRED_RUNS + 9).as_str());
        assert!(session.retired_runs.contains(&newest));
    }

    #[test]
    fn run_is_sent_even_when_connection_is_down() {
        let (conn, mut driver) = ChannelConnection::new(4);
        let mut session = SessionController::new(
            SessionId::new("s1"),
            RunOptions::with_model("p", "m"),
            Arc::new(conn),
        );
        let options = session.options().clone();
        session.start_run("hello", options).unwrap();

        assert!(session.is_running());
        assert!(driver.outbound.try_recv().is_err());
    }

    #[test]
    fn files_are_attached_to_the_human_turn() {
        let (mut session, mut driver) = open_session("s1");
        let mut options = session.options().clone();
        options.files = vec![FileAttachment {
            provider: "s3".to_string(),
            key: "a.png".to_string(),
        }];
        session.start_run("describe", options).unwrap();

        let human = &session.snapshot()[0];
        assert_eq!(human.metadata.files.as_ref().unwrap()[0].key, "a.png");
        let ProtocolMessage::Run(req) = driver.outbound.try_recv().unwrap() else {
            panic!("expected run");
        };
        assert_eq!(req.files.len(), 1);
    }

    struct FixedHistory(Option<Vec<Turn>>);

    impl HistorySource for FixedHistory {
        async fn fetch_persisted_history(
            &self,
            _session_id: &SessionId,
        ) -> Result<Option<Vec<Turn>>, crate::error::CollaboratorError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn hydrate_loads_history_before_first_run() {
        let (mut session, _driver) = open_session("s1");
        let source = FixedHistory(Some(vec![Turn::human("q"), Turn::ai("a")]));

        assert_eq!(session.hydrate(&source).await.unwrap(), 2);
        assert!(!session.is_loading());

        let options = session.options().clone();
        session.start_run("follow up", options).unwrap();
        assert_eq!(session.turn_log().len(), 4);

        let err = session.hydrate(&source).await.unwrap_err();
        assert_eq!(err.error_code(), "not_idle");
    }

    #[tokio::test]
    async fn hydrate_not_found_leaves_log_empty() {
        let (mut session, _driver) = open_session("s1");
        assert_eq!(session.hydrate(&FixedHistory(None)).await.unwrap(), 0);
        assert!(session.turn_log().is_empty());
    }

    #[test]
    fn loading_blocks_runs() {
        let (mut session, _driver) = open_session("s1");
        session.begin_loading().unwrap();
        let options = session.options().clone();
        assert_eq!(
            session.start_run("hi", options).unwrap_err().error_code(),
            "not_idle"
        );
        session.finish_loading(None);
        assert!(!session.is_loading());
    }
}
