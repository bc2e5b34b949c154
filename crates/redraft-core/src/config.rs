use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use redraft_providers::{BackendConfig, RetryPolicy, DEFAULT_ENDPOINT, DEFAULT_MODEL};

use crate::orchestrator::DEFAULT_MAX_CONCURRENT;

pub const ENDPOINT_ENV: &str = "REDRAFT_ENDPOINT";
pub const MODEL_ENV: &str = "REDRAFT_MODEL";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub endpoint: String,
    pub model: String,
    pub max_concurrent: usize,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            request_timeout_secs: 20,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            retry: self.retry,
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("redraft").join("config.json"))
}

/// Load configuration: the explicit file if given, the default path if it
/// exists, built-in defaults otherwise. Environment variables override the
/// endpoint and model.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(path) => read_config_file(path)?,
        None => match default_config_path() {
            Some(path) if path.is_file() => read_config_file(&path)?,
            _ => EngineConfig::default(),
        },
    };
    apply_overrides(
        &mut config,
        std::env::var(ENDPOINT_ENV).ok(),
        std::env::var(MODEL_ENV).ok(),
    );
    Ok(config)
}

fn apply_overrides(config: &mut EngineConfig, endpoint: Option<String>, model: Option<String>) {
    if let Some(endpoint) = endpoint.filter(|value| !value.trim().is_empty()) {
        config.endpoint = endpoint;
    }
    if let Some(model) = model.filter(|value| !value.trim().is_empty()) {
        config.model = model;
    }
    config.max_concurrent = config.max_concurrent.max(1);
}

fn read_config_file(path: &Path) -> anyhow::Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_local_endpoint() {
        let config = EngineConfig::default();
        assert_eq!(config.endpoint, "http://127.0.0.1:11434/api/generate");
        assert_eq!(config.model, "llama3.2:latest");
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.request_timeout_secs, 20);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"model": "mistral:7b"}"#).unwrap();

        let config = read_config_file(&path).unwrap();
        assert_eq!(config.model, "mistral:7b");
        assert_eq!(config.endpoint, EngineConfig::default().endpoint);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(read_config_file(&path).is_err());
    }

    #[test]
    fn overrides_replace_endpoint_and_model() {
        let mut config = EngineConfig::default();
        apply_overrides(
            &mut config,
            Some("http://10.0.0.5:11434/api/generate".to_string()),
            Some("  ".to_string()),
        );
        assert_eq!(config.endpoint, "http://10.0.0.5:11434/api/generate");
        assert_eq!(config.model, EngineConfig::default().model);
    }

    #[test]
    fn concurrency_is_clamped_to_at_least_one() {
        let mut config = EngineConfig {
            max_concurrent: 0,
            ..EngineConfig::default()
        };
        apply_overrides(&mut config, None, None);
        assert_eq!(config.max_concurrent, 1);
    }

    #[test]
    fn backend_config_carries_retry_tuning() {
        let config = EngineConfig {
            request_timeout_secs: 5,
            ..EngineConfig::default()
        };
        let backend = config.backend_config();
        assert_eq!(backend.request_timeout, Duration::from_secs(5));
        assert_eq!(backend.retry, config.retry);
    }
}
