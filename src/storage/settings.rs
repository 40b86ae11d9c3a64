//! Server settings
//!
//! Loaded once at startup from a JSON file, then patched from environment
//! variables. Every field has a default so the server starts with no file.

use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit settings file
pub const CONFIG_ENV: &str = "BRANCHLM_CONFIG";

/// Upper bound for `max_tokens`, both in settings and per request
pub const MAX_TOKENS_LIMIT: u32 = 4096;

pub const DEFAULT_CHAT_SYSTEM_PROMPT: &str = "You are a helpful tutor focused on helping undergrads understand concepts intuitively with concise examples.";
pub const DEFAULT_FOCUS_SYSTEM_PROMPT: &str =
    "You are a helpful, concise assistant focused on the provided excerpt.";

/// Sampling defaults for one kind of turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnSettings {
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature for sampling (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            max_tokens: 768,
            temperature: 0.4,
            top_p: 0.95,
            top_k: 40,
        }
    }
}

impl TurnSettings {
    fn focus_default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.3,
            ..Self::default()
        }
    }

    fn validate(&mut self, fallback: &TurnSettings) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        if self.top_k == 0 {
            self.top_k = fallback.top_k;
        }
        if self.max_tokens == 0 {
            self.max_tokens = fallback.max_tokens;
        }
        self.max_tokens = self.max_tokens.min(MAX_TOKENS_LIMIT);
    }
}

/// Server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the HTTP server binds to
    pub bind_address: String,
    /// Path to the GGUF model file
    pub model_path: PathBuf,
    /// Context window size
    pub context_size: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Maximum tokens evaluated per decode call
    pub batch_size: u32,
    /// Comma-separated list of allowed CORS origins; `None` allows any
    pub cors_allowed_origins: Option<String>,
    /// `tracing` filter used when `RUST_LOG` is not set
    pub log_level: String,
    /// System prompt for `/generate` when the request omits one
    pub chat_system_prompt: String,
    /// System prompt for `/focus` when the request omits one
    pub focus_system_prompt: String,
    /// Sampling defaults for `/generate` and `/continue`
    pub chat: TurnSettings,
    /// Sampling defaults for `/focus`
    pub focus: TurnSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8000".to_string(),
            model_path: PathBuf::from("models/Llama-3.2-3B-Instruct-Q4_K_M.gguf"),
            context_size: 4096,
            gpu_layers: 32,
            batch_size: 512,
            cors_allowed_origins: None,
            log_level: "info".to_string(),
            chat_system_prompt: DEFAULT_CHAT_SYSTEM_PROMPT.to_string(),
            focus_system_prompt: DEFAULT_FOCUS_SYSTEM_PROMPT.to_string(),
            chat: TurnSettings::default(),
            focus: TurnSettings::focus_default(),
        }
    }
}

impl ServerSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        let defaults = ServerSettings::default();

        if self.context_size < 512 {
            self.context_size = defaults.context_size;
        }

        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }
        self.batch_size = self.batch_size.min(self.context_size);

        if self.bind_address.trim().is_empty() {
            self.bind_address = defaults.bind_address;
        }

        if self.log_level.trim().is_empty() {
            self.log_level = defaults.log_level;
        }

        self.chat.validate(&defaults.chat);
        self.focus.validate(&defaults.focus);
    }

    /// Applies `BRANCHLM_*` overrides from an environment lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("BRANCHLM_MODEL") {
            self.model_path = PathBuf::from(model);
        }
        if let Some(bind) = lookup("BRANCHLM_BIND") {
            self.bind_address = bind;
        }
        if let Some(layers) = lookup("BRANCHLM_GPU_LAYERS").and_then(|v| v.parse().ok()) {
            self.gpu_layers = layers;
        }
        if let Some(ctx) = lookup("BRANCHLM_CTX").and_then(|v| v.parse().ok()) {
            self.context_size = ctx;
        }
    }
}

/// Get the default settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from `BRANCHLM_CONFIG` or the data directory, then apply
/// environment overrides.
///
/// Falls back to defaults if the file doesn't exist or is corrupted.
pub fn load_settings() -> ServerSettings {
    let path = match std::env::var(CONFIG_ENV) {
        Ok(path) => Ok(PathBuf::from(path)),
        Err(_) => get_settings_path(),
    };

    let mut settings = match path.and_then(|p| load_settings_from(&p)) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("WARN: failed to load settings, using defaults: {e}");
            ServerSettings::default()
        }
    };

    settings.apply_overrides(|key| std::env::var(key).ok());
    settings.validate();
    settings
}

/// Reads settings from a specific file
pub fn load_settings_from(path: &Path) -> Result<ServerSettings, StorageError> {
    // Runs before tracing is installed, so notes go straight to stderr
    if !path.exists() {
        eprintln!("INFO: settings file {} not found, using defaults", path.display());
        return Ok(ServerSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: ServerSettings = serde_json::from_str(&json)?;
    settings.validate();

    eprintln!("INFO: loaded settings from {}", path.display());
    Ok(settings)
}
