use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// One open workspace per daemon; requests run sequentially against it.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    pub fn db_path(&self) -> Option<PathBuf> {
        self.workspace
            .as_ref()
            .map(|w| w.join(crate::db::DB_FILE_NAME))
    }
}
