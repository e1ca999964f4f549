pub mod provider;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheOptions;
use crate::error::ConfigError;
use crate::fallback::FallbackConfig;
use crate::types::{ProviderInstance, ProviderType};

pub use provider::{InMemoryProviderRegistry, ProviderRegistry};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub providers: Vec<ProviderInstance>,
    pub fallback: FallbackConfig,
    pub cache: CacheConfig,
    /// Per-vendor API base overrides, e.g. a local OpenAI-compatible server.
    pub api_bases: HashMap<ProviderType, String>,
}

impl Config {
    pub fn registry(&self) -> InMemoryProviderRegistry {
        InMemoryProviderRegistry::from_instances(self.providers.iter().cloned())
    }

    /// Reject configs the layer cannot serve.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for inst in &self.providers {
            if inst.id.is_empty() {
                return Err(ConfigError::Invalid("provider instance with empty id".into()));
            }
            if !seen.insert(inst.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider instance id: {}",
                    inst.id
                )));
            }
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid("cache.maxEntries must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_ms: u64,
    pub max_entries: usize,
    pub eviction_batch: usize,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 300_000,
            max_entries: 1000,
            eviction_batch: 100,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn options(&self) -> CacheOptions {
        CacheOptions {
            default_ttl: self.ttl(),
            max_entries: self.max_entries,
            eviction_batch: self.eviction_batch,
        }
    }
}

/// Load config from environment variables.
///
/// Priority:
/// 1. `CHATGATE_CONFIG` env var: full JSON config
/// 2. File (`~/.chatgate/config.json`) with individual env vars on top
pub fn load_config_from_env() -> Config {
    if let Ok(json) = std::env::var("CHATGATE_CONFIG") {
        match parse_config(&json) {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!("Ignoring CHATGATE_CONFIG: {}", e);
            }
        }
    }

    let mut cfg = load_config(None);
    apply_env_overrides(&mut cfg, |name| std::env::var(name).ok());
    cfg
}

/// Parse and validate an inline JSON config.
pub fn parse_config(json: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHATGATE_FALLBACK_ENABLED") {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => cfg.fallback.enabled = true,
            "0" | "false" | "no" | "off" => cfg.fallback.enabled = false,
            other => tracing::warn!("Ignoring CHATGATE_FALLBACK_ENABLED={}", other),
        }
    }
    if let Some(v) = var("CHATGATE_CACHE_TTL_MS") {
        match v.trim().parse::<u64>() {
            Ok(ms) => cfg.cache.ttl_ms = ms,
            Err(e) => tracing::warn!("Ignoring CHATGATE_CACHE_TTL_MS: {}", e),
        }
    }
}

pub fn get_config_path() -> PathBuf {
    get_data_dir().join("config.json")
}

/// Get the chatgate data directory.
pub fn get_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatgate")
}

/// Load configuration from file or create default.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    match try_load_config(&path) {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) => Config::default(),
        Err(e) => {
            tracing::warn!("Failed to load config from {}: {}", path.display(), e);
            tracing::warn!("Using default configuration.");
            Config::default()
        }
    }
}

/// Strict variant of [`load_config`].
pub fn try_load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    parse_config(&content)
}

/// Save configuration to file.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> Result<(), ConfigError> {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(())
}
