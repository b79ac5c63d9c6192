//! Contracts for the request/response services the engine consults.
//!
//! These live outside the reconciliation core; only their shapes matter here.

use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::error::CollaboratorError;
use crate::ids::SessionId;
use crate::turn_log::Turn;

pub trait HistorySource {
    /// `Ok(None)` means the session has never been persisted.
    fn fetch_persisted_history(
        &self,
        session_id: &SessionId,
    ) -> impl Future<Output = Result<Option<Vec<Turn>>, CollaboratorError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceDescriptor {
    pub id: String,
    pub name: String,
}

pub trait Catalog {
    fn list_available_models(&self) -> Result<Vec<ModelDescriptor>, CollaboratorError>;

    fn list_available_workspaces(&self) -> Result<Vec<WorkspaceDescriptor>, CollaboratorError>;
}

/// A catalog fixed at construction, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    models: Vec<ModelDescriptor>,
    workspaces: Vec<WorkspaceDescriptor>,
}

impl StaticCatalog {
    pub fn new(models: Vec<ModelDescriptor>, workspaces: Vec<WorkspaceDescriptor>) -> Self {
        Self { models, workspaces }
    }

    pub fn find_model(&self, provider: &str, name: &str) -> Option<&ModelDescriptor> {
        self.models
            .iter()
            .find(|m| m.provider == provider && m.name == name)
    }
}

impl Catalog for StaticCatalog {
    fn list_available_models(&self) -> Result<Vec<ModelDescriptor>, CollaboratorError> {
        Ok(self.models.clone())
    }

    fn list_available_workspaces(&self) -> Result<Vec<WorkspaceDescriptor>, CollaboratorError> {
        Ok(self.workspaces.clone())
    }
}
