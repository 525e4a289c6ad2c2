use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub control_plane: ControlPlaneConfig,
    pub auth: AuthConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub backoff: BackoffConfig,
    pub providers: ProvidersConfig,
    pub usage: UsageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub base_url: String,
    pub sync_interval_seconds: u64,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Base64-encoded HMAC signing key shared with the token issuer.
    pub signing_key: String,
    pub issuer: String,
    /// Applied when a capability carries no requests_per_minute constraint.
    pub default_requests_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_seconds: u64,
    pub cap_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub groq: ProviderConfig,
    pub nim: ProviderConfig,
    pub bge: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub enabled: bool,
    /// Seed endpoints used until the first control-plane sync lands. An
    /// empty list round-trips through the config layers as an absent key.
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    pub queue_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            control_plane: ControlPlaneConfig {
                base_url: "http://localhost:8080".to_string(),
                sync_interval_seconds: 30,
                request_timeout_seconds: 10,
            },
            auth: AuthConfig {
                signing_key: String::new(),
                issuer: "control-plane".to_string(),
                default_requests_per_minute: 60,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                recovery_timeout_seconds: 60,
            },
            backoff: BackoffConfig {
                base_seconds: 300,
                cap_seconds: 3600,
            },
            providers: ProvidersConfig {
                groq: ProviderConfig {
                    enabled: true,
                    endpoints: vec!["https://api.groq.com".to_string()],
                    timeout_seconds: 30,
                },
                nim: ProviderConfig {
                    enabled: true,
                    endpoints: vec![],
                    timeout_seconds: 120,
                },
                bge: ProviderConfig {
                    enabled: true,
                    endpoints: vec![],
                    timeout_seconds: 30,
                },
            },
            usage: UsageConfig { queue_size: 1024 },
        }
    }
}

impl GatewayConfig {
    /// Layered load: built-in defaults, then an optional config file, then
    /// `MODELGATE_*` environment overrides (`MODELGATE_AUTH__ISSUER` etc).
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&Self::default())?;

        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = config_file {
            info!("Loading gateway configuration from {:?}", path);
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix("MODELGATE").separator("__"));

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.control_plane.sync_interval_seconds)
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = GatewayConfig::load(None).unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.backoff.base_seconds, 300);
        assert_eq!(config.auth.default_requests_per_minute, 60);
        assert_eq!(config.providers.nim.timeout_seconds, 120);
        // Empty seed lists survive the defaults round trip.
        assert!(config.providers.nim.endpoints.is_empty());
        assert!(config.providers.bge.endpoints.is_empty());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [control_plane]
            base_url = "https://cp.internal"
            sync_interval_seconds = 5

            [auth]
            issuer = "cp-staging"

            [providers.nim]
            endpoints = ["https://nim-a.internal", "https://nim-b.internal"]
            "#
        )
        .unwrap();

        let config = GatewayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.control_plane.base_url, "https://cp.internal");
        assert_eq!(config.sync_interval(), Duration::from_secs(5));
        assert_eq!(config.auth.issuer, "cp-staging");
        assert_eq!(config.providers.nim.endpoints.len(), 2);
        // Untouched sections keep their defaults.
        assert_eq!(config.circuit_breaker.recovery_timeout_seconds, 60);
    }
}
