//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which holds the backend project URL and keys plus the last used email.
//!
//! Configuration is stored at `~/.config/fintrack/config.json`. Every backend
//! setting can be overridden with a `FINTRACK_*` environment variable.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::TOKEN_REFRESH_BUFFER_SECS;
use crate::subscription::client::DEFAULT_BASE_URL;

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "fintrack";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_SUPABASE_URL: &str = "FINTRACK_SUPABASE_URL";
const ENV_SUPABASE_ANON_KEY: &str = "FINTRACK_SUPABASE_ANON_KEY";
const ENV_REVENUECAT_API_KEY: &str = "FINTRACK_REVENUECAT_API_KEY";
const ENV_REVENUECAT_BASE_URL: &str = "FINTRACK_REVENUECAT_BASE_URL";
const ENV_CACHE_DIR: &str = "FINTRACK_CACHE_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<String>,
    pub revenuecat_api_key: Option<String>,
    pub revenuecat_base_url: Option<String>,
    pub refresh_margin_secs: Option<i64>,
    pub last_email: Option<String>,
}

/// Settings needed to talk to the backend, after overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub revenuecat_api_key: Option<String>,
    pub revenuecat_base_url: String,
    pub refresh_margin_secs: i64,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the persisted session and user info.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Ok(dir) = std::env::var(ENV_CACHE_DIR) {
            return Ok(PathBuf::from(dir));
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Resolve backend settings from the environment, falling back to the file.
    pub fn backend(&self) -> Result<BackendConfig> {
        self.backend_with(|key| std::env::var(key).ok())
    }

    fn backend_with(&self, env: impl Fn(&str) -> Option<String>) -> Result<BackendConfig> {
        let pick = |key: &str, file: &Option<String>| {
            env(key)
                .filter(|v| !v.trim().is_empty())
                .or_else(|| file.clone())
        };

        let supabase_url = pick(ENV_SUPABASE_URL, &self.supabase_url)
            .with_context(|| format!("Backend URL not configured (set {})", ENV_SUPABASE_URL))?;
        let supabase_anon_key = pick(ENV_SUPABASE_ANON_KEY, &self.supabase_anon_key)
            .with_context(|| format!("Backend anon key not configured (set {})", ENV_SUPABASE_ANON_KEY))?;

        Ok(BackendConfig {
            supabase_url,
            supabase_anon_key,
            revenuecat_api_key: pick(ENV_REVENUECAT_API_KEY, &self.revenuecat_api_key),
            revenuecat_base_url: pick(ENV_REVENUECAT_BASE_URL, &self.revenuecat_base_url)
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            refresh_margin_secs: self
                .refresh_margin_secs
                .filter(|secs| *secs >= 0)
                .unwrap_or(TOKEN_REFRESH_BUFFER_SECS),
        })
    }
}
