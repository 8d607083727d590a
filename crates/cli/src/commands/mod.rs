pub mod ask;
pub mod config_cmd;
pub mod history;

use std::sync::Arc;

use devassist_config::AppConfig;
use devassist_core::history::HistoryStore;
use devassist_history::{FileHistory, InMemoryHistory};

/// The history store selected in the configuration.
pub fn history_store(config: &AppConfig) -> Arc<dyn HistoryStore> {
    match config.history.backend.as_str() {
        "memory" => Arc::new(InMemoryHistory::new()),
        _ => Arc::new(FileHistory::new(config.history.resolved_path())),
    }
}

fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    AppConfig::load().map_err(|e| format!("Failed to load config: {e}").into())
}
