use serde::Deserialize;
use std::path::Path;

use crate::error::BridgeError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_name")]
    pub name: String,
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub caller: CallerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

/// Client-facing HTTP listener.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Worker-facing frame gateway listener.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_host")]
    pub host: String,
    #[serde(default = "default_worker_port")]
    pub port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: default_worker_host(),
            port: default_worker_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Provider selector: "openai" or "azopenai".
    pub name: String,
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub deployment_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CallerConfig {
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,
    /// 0 disables idle expiry.
    #[serde(default)]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
            cache_ttl_secs: 0,
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Supports ${ENV_VAR} substitution
    pub token: String,
}

fn default_name() -> String {
    "llm-bridge".to_string()
}

fn default_worker_host() -> String {
    "0.0.0.0".to_string()
}

fn default_worker_port() -> u16 {
    9000
}

fn default_cache_size() -> u64 {
    1
}

fn default_call_timeout_secs() -> u64 {
    60
}

impl Config {
    /// Loads the config file, expanding `${ENV_VAR}` references.
    ///
    /// A missing file is `ConfigNotFound`, which callers treat as
    /// "the bridge is not configured here" rather than a failure.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            return Err(BridgeError::ConfigNotFound(path.to_string()).into());
        }
        let content = std::fs::read_to_string(path)?;
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}
