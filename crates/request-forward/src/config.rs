//! Configuration types and loading logic.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use forward_tracing::TracingConfig;
use serde::Deserialize;

use crate::options::DefaultOptions;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Process-wide default forward options.
    #[serde(default)]
    pub defaults: DefaultOptions,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Server listen configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Largest inbound body buffered for forwarding.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

/// Fallback forwarding of unmatched requests to `defaults.base_url`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_listen_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

impl ForwardConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (FORWARD_ prefix, __ for nesting)
    /// 2. TOML config file
    /// 3. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let config: ForwardConfig = Self::figment(config_path).extract()?;
        config.defaults.validate()?;
        if config.fallback.enabled
            && config.defaults.base_url.as_deref().filter(|b| !b.is_empty()).is_none()
        {
            anyhow::bail!("[fallback] enabled requires defaults.base_url to be set");
        }
        Ok(config)
    }

    fn figment(config_path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("FORWARD_").split("__"))
    }
}
