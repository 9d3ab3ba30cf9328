//! Persistent storage
//!
//! Settings persistence and model file discovery.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod models;
pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Model not found: {0}")]
    ModelNotFound(String),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\PocketLLM\PocketLLM`
/// - macOS: `/Users/{user}/Library/Application Support/com.PocketLLM.PocketLLM`
/// - Linux: `/home/{user}/.local/share/pocketllm`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "PocketLLM", "PocketLLM")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Create the data directory and its default `models/` folder
pub fn init_storage() -> Result<PathBuf, StorageError> {
    let data_dir = get_data_dir()?;
    init_storage_at(&data_dir)?;
    Ok(data_dir)
}

/// Create the storage layout under `data_dir`. Existing folders are kept.
pub fn init_storage_at(data_dir: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(data_dir.join("models"))?;

    tracing::debug!("Initialized storage at: {}", data_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_retrieval() {
        let path = get_data_dir().unwrap();
        assert!(path.to_string_lossy().to_lowercase().contains("pocketllm"));
    }

    #[test]
    fn test_init_storage_creates_models_dir() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("pocketllm");

        init_storage_at(&data_dir).unwrap();
        assert!(data_dir.join("models").is_dir());

        // Running again over an existing layout is fine.
        init_storage_at(&data_dir).unwrap();
    }

    #[test]
    fn test_model_not_found_message() {
        let err = StorageError::ModelNotFound("tiny.gguf".into());
        assert_eq!(err.to_string(), "Model not found: tiny.gguf");
    }
}
