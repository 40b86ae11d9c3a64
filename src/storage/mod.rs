//! Storage
//!
//! The in-memory message store and on-disk server settings.

use std::path::PathBuf;
use thiserror::Error;

pub mod messages;
pub mod settings;

pub use messages::{MessageRecord, MessageStore, MessageSummary};
pub use settings::{load_settings, ServerSettings, TurnSettings, MAX_TOKENS_LIMIT};

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\branchlm\branchlm`
/// - macOS: `/Users/{user}/Library/Application Support/dev.branchlm.branchlm`
/// - Linux: `/home/{user}/.local/share/branchlm`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("dev", "branchlm", "branchlm")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}
