use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::calc::SchoolVariant;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Variant pinned into newly created workspaces.
    pub default_variant: SchoolVariant,
    /// Variant of the open workspace.
    pub variant: SchoolVariant,
}

impl AppState {
    pub fn new(default_variant: SchoolVariant) -> Self {
        Self {
            workspace: None,
            db: None,
            default_variant,
            variant: default_variant,
        }
    }
}

/// Capability passed explicitly with every write request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteContext {
    pub actor_id: String,
    #[serde(default)]
    pub can_modify_existing: bool,
}
