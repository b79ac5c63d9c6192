//! File-backed persisted history.

use chatmux::{CollaboratorError, HistorySource, SessionId, Turn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Either one transcript, or transcripts keyed by session id.
#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryFile {
    Single(Vec<Turn>),
    BySession(HashMap<String, Vec<Turn>>),
}

#[derive(Debug, Clone)]
pub struct JsonHistory {
    path: PathBuf,
}

impl JsonHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HistorySource for JsonHistory {
    async fn fetch_persisted_history(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Vec<Turn>>, CollaboratorError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CollaboratorError::Unavailable(format!(
                    "{}: {e}",
                    self.path.display()
                )));
            }
        };
        let parsed: HistoryFile = serde_json::from_str(&text).map_err(|e| {
            CollaboratorError::Malformed(format!("{}: {e}", self.path.display()))
        })?;
        Ok(match parsed {
            HistoryFile::Single(turns) => Some(turns),
            HistoryFile::BySession(mut map) => map.remove(session_id.as_str()),
        })
    }
}
