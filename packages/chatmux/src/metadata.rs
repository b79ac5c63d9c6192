//! Turn metadata.
//!
//! The backend attaches loosely-shaped metadata to turns. The shapes the client
//! knows about (retrieved documents, rendered prompts, file attachments) get
//! typed fields; everything else lands in `extra` untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents: Option<Vec<Document>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileAttachment>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A retrieved source document the answer was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default)]
    pub page_content: String,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    pub provider: String,
    pub key: String,
}

impl TurnMetadata {
    pub fn with_files(files: Vec<FileAttachment>) -> Self {
        Self {
            files: Some(files),
            ..Default::default()
        }
    }

    /// Merge an incoming update over `self`.
    ///
    /// Each known shape present in `incoming` replaces the current one; absent
    /// shapes are retained. `extra` merges key by key with incoming keys winning.
    pub fn merge(&self, incoming: &TurnMetadata) -> TurnMetadata {
        let mut extra = self.extra.clone();
        for (key, value) in &incoming.extra {
            extra.insert(key.clone(), value.clone());
        }
        TurnMetadata {
            documents: incoming
                .documents
                .clone()
                .or_else(|| self.documents.clone()),
            prompts: incoming.prompts.clone().or_else(|| self.prompts.clone()),
            files: incoming.files.clone().or_else(|| self.files.clone()),
            extra,
        }
    }
}
