//! User settings: per-provider credentials and model lists.
//!
//! Settings are loaded from a JSON file (e.g. `~/.parley/settings.json`) and
//! environment. API keys from the environment override the file
//! (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, ...). The orchestration core only
//! ever reads settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level user settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    /// Per-provider settings keyed by provider name (e.g. "openai").
    #[serde(default)]
    pub provider_settings: HashMap<String, ProviderSettings>,
}

/// Settings for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    /// API key. Overridden by `<PROVIDER>_API_KEY` env when set.
    pub api_key: Option<String>,
    /// Override the provider's default endpoint (e.g. an OpenAI-compatible
    /// local server).
    pub base_url: Option<String>,
    /// Model ids to expose for this provider. Empty = adapter defaults.
    #[serde(default)]
    pub models: Vec<String>,
}

impl UserSettings {
    pub fn provider(&self, name: &str) -> ProviderSettings {
        self.provider_settings.get(name).cloned().unwrap_or_default()
    }
}

/// Resolve the API key for a provider: env `<PROVIDER>_API_KEY` overrides the
/// settings file value. Empty strings count as unset.
pub fn resolve_api_key(settings: &UserSettings, provider: &str) -> Option<String> {
    let env_key = format!("{}_API_KEY", provider.to_uppercase().replace('-', "_"));
    std::env::var(&env_key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            settings
                .provider(provider)
                .api_key
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve settings path from env or default (`~/.parley/settings.json`).
pub fn default_settings_path() -> PathBuf {
    std::env::var("PARLEY_SETTINGS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".parley").join("settings.json"))
                .unwrap_or_else(|| PathBuf::from("settings.json"))
        })
}

/// Load settings from the given path (or the default). Missing file => default
/// settings. Returns the settings and the path that was used.
pub fn load_settings(path: Option<PathBuf>) -> Result<(UserSettings, PathBuf)> {
    let path = path.unwrap_or_else(default_settings_path);
    let settings = if !path.exists() {
        log::debug!("settings file not found, using defaults: {}", path.display());
        UserSettings::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing settings from {}", path.display()))?
    };
    Ok((settings, path))
}

/// Create the settings directory and a skeleton settings file if missing.
/// Returns the path written (or already present).
pub fn init_settings_file(path: Option<PathBuf>) -> Result<PathBuf> {
    let path = path.unwrap_or_else(default_settings_path);
    if path.exists() {
        return Ok(path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating settings directory {}", parent.display()))?;
    }
    let mut skeleton = UserSettings::default();
    skeleton
        .provider_settings
        .insert("openai".to_string(), ProviderSettings::default());
    skeleton
        .provider_settings
        .insert("anthropic".to_string(), ProviderSettings::default());
    let body = serde_json::to_string_pretty(&skeleton)?;
    std::fs::write(&path, body)
        .with_context(|| format!("writing settings to {}", path.display()))?;
    Ok(path)
}

/// Read-only settings collaborator consumed by provider adapters.
pub trait SettingsStore: Send + Sync {
    fn get_user_settings(&self) -> Result<UserSettings>;
}

/// Settings store backed by a JSON file; re-reads on every call so
/// `reload_all_settings` observes credential changes.
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for FileSettingsStore {
    fn get_user_settings(&self) -> Result<UserSettings> {
        load_settings(Some(self.path.clone())).map(|(s, _)| s)
    }
}

/// Fixed in-memory settings, for tests and programmatic embedding.
pub struct StaticSettings(pub UserSettings);

impl SettingsStore for StaticSettings {
    fn get_user_settings(&self) -> Result<UserSettings> {
        Ok(self.0.clone())
    }
}
