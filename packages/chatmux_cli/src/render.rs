//! Terminal rendering of session events.

use chatmux::{Role, SessionEvent, SessionId, Turn};
use std::collections::HashMap;
use std::io::{self, Write};

pub struct Renderer {
    /// Print deltas as tokens arrive; otherwise only finished turns are shown.
    stream: bool,
    labels: HashMap<SessionId, String>,
    /// What is already on screen for each in-flight turn.
    printed: HashMap<SessionId, String>,
}

impl Renderer {
    pub fn streaming() -> Self {
        Self::new(true)
    }

    pub fn buffered() -> Self {
        Self::new(false)
    }

    fn new(stream: bool) -> Self {
        Self {
            stream,
            labels: HashMap::new(),
            printed: HashMap::new(),
        }
    }

    pub fn set_label(&mut self, session_id: SessionId, label: impl Into<String>) {
        self.labels.insert(session_id, label.into());
    }

    fn prefix(&self, session_id: &SessionId) -> String {
        self.labels
            .get(session_id)
            .map(|label| format!("[{label}] "))
            .unwrap_or_default()
    }

    /// Replay a hydrated transcript.
    pub fn print_history(&self, turns: &[Turn], out: &mut impl Write) -> io::Result<()> {
        for turn in turns {
            let who = match turn.role {
                Role::Human => "you",
                Role::Ai => "ai",
            };
            writeln!(out, "{who}: {}", turn.content)?;
        }
        Ok(())
    }

    pub fn render(&mut self, event: &SessionEvent, out: &mut impl Write) -> io::Result<()> {
        match event {
            SessionEvent::Started { session_id } => {
                self.printed.insert(session_id.clone(), String::new());
            }
            SessionEvent::ContentUpdated {
                session_id,
                content,
            } => {
                if self.stream {
                    self.write_delta(session_id, content, out)?;
                    out.flush()?;
                }
            }
            SessionEvent::Completed {
                session_id,
                content,
                ..
            } => {
                if self.stream && self.printed.contains_key(session_id) {
                    self.write_delta(session_id, content, out)?;
                    writeln!(out)?;
                } else {
                    writeln!(out, "{}{content}", self.prefix(session_id))?;
                }
                self.printed.remove(session_id);
            }
            SessionEvent::Failed {
                session_id,
                content,
                ..
            } => {
                if self.printed.remove(session_id).is_some_and(|p| !p.is_empty()) {
                    writeln!(out)?;
                }
                writeln!(out, "{}error: {content}", self.prefix(session_id))?;
            }
            SessionEvent::TokenRejected { .. } => {}
        }
        Ok(())
    }

    fn write_delta(
        &mut self,
        session_id: &SessionId,
        content: &str,
        out: &mut impl Write,
    ) -> io::Result<()> {
        let shown = self.printed.entry(session_id.clone()).or_default();
        match content.strip_prefix(shown.as_str()) {
            Some(delta) => write!(out, "{delta}")?,
            // content was rewritten, start the line over
            None => write!(out, "\n{content}")?,
        }
        *shown = content.to_string();
        Ok(())
    }
}
