//! Configuration for the crucible engine.
//!
//! Settings live in ~/.config/crucible/config.json. A corrupt file is
//! backed up and replaced with defaults rather than aborting startup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Stored API key. The OPENROUTER_API_KEY environment variable takes
    /// precedence when set.
    pub openrouter_api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Reflect-and-retry cycles allowed per task unless the submission
    /// overrides it.
    #[serde(default = "default_retry_budget")]
    pub default_retry_budget: u32,
    /// How long a tool proposal may wait for a decision before it is
    /// treated as denied.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
    /// Wall-clock limit for a single sandboxed command.
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    #[serde(default = "default_sandbox_image")]
    pub sandbox_image: String,
    #[serde(default = "default_sandbox_memory_limit")]
    pub sandbox_memory_limit: String,
    #[serde(default = "default_sandbox_cpus")]
    pub sandbox_cpus: f64,
    /// Idle sessions older than this are reaped.
    #[serde(default = "default_session_lease_secs")]
    pub session_lease_secs: u64,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_retry_budget() -> u32 {
    5
}

fn default_approval_timeout_secs() -> u64 {
    300
}

fn default_exec_timeout_secs() -> u64 {
    30
}

fn default_sandbox_image() -> String {
    "python:3.10-slim".to_string()
}

fn default_sandbox_memory_limit() -> String {
    "512m".to_string()
}

fn default_sandbox_cpus() -> f64 {
    0.5
}

fn default_session_lease_secs() -> u64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        Config {
            openrouter_api_key: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            default_retry_budget: default_retry_budget(),
            approval_timeout_secs: default_approval_timeout_secs(),
            exec_timeout_secs: default_exec_timeout_secs(),
            sandbox_image: default_sandbox_image(),
            sandbox_memory_limit: default_sandbox_memory_limit(),
            sandbox_cpus: default_sandbox_cpus(),
            session_lease_secs: default_session_lease_secs(),
        }
    }
}

impl Config {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("crucible"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return defaults.
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        warn!("config file was corrupted ({err}); a backup was saved and defaults were loaded");
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
        fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)) {
                warn!("failed to set config directory permissions: {err}");
            }
        }

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Resolve the API key: environment first, then the stored value.
    pub fn api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            if !key.trim().is_empty() {
                return Some(key);
            }
        }
        self.openrouter_api_key.clone()
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn session_lease(&self) -> Duration {
        Duration::from_secs(self.session_lease_secs)
    }
}

fn preserve_corrupt_config(path: &std::path::Path, content: &str) {
    let backup = path.with_extension("json.corrupt");
    if let Err(err) = fs::write(&backup, content) {
        warn!("failed to back up corrupt config: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.default_retry_budget, 5);
        assert_eq!(config.exec_timeout(), Duration::from_secs(30));
        assert_eq!(config.session_lease(), Duration::from_secs(3600));
        assert!(config.openrouter_api_key.is_none());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: Config =
            serde_json::from_str(r#"{"openrouter_api_key": "sk-test", "max_tokens": 4096}"#)
                .unwrap();
        assert_eq!(parsed.max_tokens, 4096);
        assert_eq!(parsed.model, DEFAULT_MODEL);
        assert_eq!(parsed.default_retry_budget, 5);
    }

    #[test]
    fn test_round_trip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model, config.model);
        assert_eq!(back.session_lease_secs, config.session_lease_secs);
    }
}
