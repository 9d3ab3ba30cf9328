//! Settings storage
//!
//! Manages persistence of session and generation settings.

use crate::inference::backend::{BackendKind, SamplerParams};
use crate::inference::generation::StepFailurePolicy;
use crate::inference::session::SessionOptions;
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Free memory a model load needs by default
pub const DEFAULT_MIN_FREE_MEMORY_MB: u64 = 700;

/// Session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Engine used by the controller
    pub backend: BackendKind,
    /// Directory where model files (.gguf) are stored
    pub models_directory: PathBuf,
    /// Model loaded when none is named explicitly
    pub default_model: Option<String>,
    /// CPU threads for prompt evaluation and decoding
    pub threads: u32,
    /// Context window size in tokens
    pub context_size: u32,
    /// Maximum number of tokens to generate
    pub max_tokens: usize,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Sampler seed
    pub seed: u32,
    /// What a failed decode step does to the stream
    pub step_failure_policy: StepFailurePolicy,
    /// Forward llama.cpp's own logs into tracing
    pub engine_logs: bool,
    /// Free memory required before a load, in MiB. 0 disables the check.
    pub min_free_memory_mb: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let sampler = SamplerParams::default();
        Self {
            backend: BackendKind::default(),
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
            default_model: None,
            threads: default_thread_count(),
            context_size: 2048,
            max_tokens: 512,
            temperature: sampler.temperature,
            top_p: sampler.top_p,
            seed: sampler.seed,
            step_failure_policy: StepFailurePolicy::default(),
            engine_logs: false,
            min_free_memory_mb: DEFAULT_MIN_FREE_MEMORY_MB,
        }
    }
}

/// 60% of the available cores, clamped to 2..=6
pub fn default_thread_count() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    thread_count_for(cores)
}

fn thread_count_for(cores: usize) -> u32 {
    ((cores as f64 * 0.6) as u32).clamp(2, 6)
}

impl SessionSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        if !self.temperature.is_finite() {
            self.temperature = SamplerParams::default().temperature;
        }
        self.temperature = self.temperature.clamp(0.0, 2.0);

        if !self.top_p.is_finite() {
            self.top_p = SamplerParams::default().top_p;
        }
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.threads == 0 {
            self.threads = default_thread_count();
        }

        if self.context_size == 0 {
            self.context_size = 2048;
        }
    }

    pub fn sampler_params(&self) -> SamplerParams {
        SamplerParams {
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            sampler: self.sampler_params(),
            step_failure_policy: self.step_failure_policy,
            min_free_memory_mb: self.min_free_memory_mb,
        }
    }
}

/// Get the settings file path
pub fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> SessionSettings {
    match get_settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            tracing::warn!("Failed to locate settings, using defaults: {}", e);
            SessionSettings::default()
        }
    }
}

/// Load settings from a specific file, falling back to defaults
pub fn load_settings_from(path: &Path) -> SessionSettings {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            SessionSettings::default()
        }
    }
}

/// Internal settings loading with error propagation
fn load_settings_internal(path: &Path) -> Result<SessionSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(SessionSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: SessionSettings = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &SessionSettings) -> Result<PathBuf, StorageError> {
    let path = get_settings_path()?;
    save_settings_to(settings, &path)?;
    Ok(path)
}

/// Save settings to a specific file
pub fn save_settings_to(settings: &SessionSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = SessionSettings::default();
        assert_eq!(settings.backend, BackendKind::LlamaCpp);
        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.max_tokens, 512);
        assert_eq!(settings.temperature, 0.7);
        assert_eq!(settings.top_p, 0.9);
        assert_eq!(settings.seed, 42);
        assert_eq!(settings.step_failure_policy, StepFailurePolicy::EndGeneration);
        assert_eq!(settings.min_free_memory_mb, 700);
        assert!((2..=6).contains(&settings.threads));
    }

    #[test]
    fn test_thread_count_clamped() {
        assert_eq!(thread_count_for(1), 2);
        assert_eq!(thread_count_for(4), 2);
        assert_eq!(thread_count_for(8), 4);
        assert_eq!(thread_count_for(64), 6);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = SessionSettings::default();

        settings.temperature = 5.0;
        settings.top_p = 2.0;
        settings.threads = 0;
        settings.context_size = 0;
        settings.validate();

        assert_eq!(settings.temperature, 2.0);
        assert_eq!(settings.top_p, 1.0);
        assert!(settings.threads >= 2);
        assert_eq!(settings.context_size, 2048);

        settings.temperature = f32::NAN;
        settings.validate();
        assert_eq!(settings.temperature, 0.7);
    }

    #[test]
    fn test_session_options_follow_settings() {
        let settings = SessionSettings {
            temperature: 0.0,
            seed: 9,
            step_failure_policy: StepFailurePolicy::ReportError,
            ..SessionSettings::default()
        };
        let options = settings.session_options();
        assert_eq!(options.sampler.temperature, 0.0);
        assert_eq!(options.sampler.seed, 9);
        assert_eq!(options.step_failure_policy, StepFailurePolicy::ReportError);
        assert_eq!(options.min_free_memory_mb, DEFAULT_MIN_FREE_MEMORY_MB);
    }

    #[test]
    fn test_settings_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("settings.json");

        let settings = SessionSettings {
            backend: BackendKind::Simulated,
            default_model: Some("tiny.gguf".into()),
            max_tokens: 64,
            ..SessionSettings::default()
        };
        save_settings_to(&settings, &path).unwrap();

        let json = fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"backend\": \"simulated\""));
        assert!(json.contains("\"step_failure_policy\": \"end-generation\""));

        assert_eq!(load_settings_from(&path), settings);
    }

    #[test]
    fn test_partial_file_uses_defaults_for_missing_fields() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        fs::write(&path, r#"{ "backend": "unavailable", "top_p": 3.0 }"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.backend, BackendKind::Unavailable);
        assert_eq!(settings.top_p, 1.0);
        assert_eq!(settings.context_size, 2048);
    }

    #[test]
    fn test_corrupt_or_missing_file_falls_back() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        assert_eq!(load_settings_from(&path).max_tokens, 512);

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings_from(&path).max_tokens, 512);
    }
}
