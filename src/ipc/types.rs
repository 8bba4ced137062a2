use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::wizard::WizardController;

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
    /// At most one wizard session per daemon; its draft in the workspace db
    /// is what makes it resumable across restarts.
    pub wizard: Option<WizardController>,
}
