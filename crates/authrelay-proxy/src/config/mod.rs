//! Configuration types for authrelay.

mod listen;
mod upstream;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::credential::StaticCredentialSource;
use crate::resolver::StaticResolver;
use crate::task::StopTimeout;

pub use listen::{EndpointParseError, ListenerSettings, MetricsConfig, DEFAULT_BACKLOG};
pub use upstream::{CredentialConfig, UpstreamProxyConfig};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Listener endpoints, e.g. `127.0.0.1:8888,backlog=64;[::1]:8888`.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Additional attempts per request after a 407 challenge.
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,

    /// Upstream proxies. Absent means every request connects directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamProxyConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<CredentialConfig>,

    /// How long shutdown waits for listeners and connections, in milliseconds.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Upper bound of idle connection objects kept for reuse.
    #[serde(default = "default_max_cached_connections")]
    pub max_cached_connections: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

fn default_listen() -> String {
    "127.0.0.1:8888".to_string()
}

fn default_retry_count() -> usize {
    2
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_max_cached_connections() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            retry_count: default_retry_count(),
            upstream: None,
            credentials: Vec::new(),
            stop_timeout_ms: default_stop_timeout_ms(),
            max_cached_connections: default_max_cached_connections(),
            metrics: None,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        ListenerSettings::parse_list(&self.listen)
            .map_err(|e| anyhow::anyhow!("Invalid 'listen' value '{}': {}", self.listen, e))?;

        if let Some(ref upstream) = self.upstream {
            upstream.parse_endpoints()?;
        }

        for credential in &self.credentials {
            credential.validate()?;
        }

        if let Some(ref metrics) = self.metrics {
            if metrics.port == 0 {
                anyhow::bail!("Metrics port must not be 0");
            }
        }

        Ok(())
    }

    pub fn listener_settings(&self) -> Result<Vec<ListenerSettings>, EndpointParseError> {
        ListenerSettings::parse_list(&self.listen)
    }

    pub fn stop_timeout(&self) -> StopTimeout {
        StopTimeout::from_millis(self.stop_timeout_ms)
    }

    /// The resolver for the configured upstream proxies, if any.
    pub fn resolver(&self) -> Result<Option<StaticResolver>, anyhow::Error> {
        match &self.upstream {
            Some(upstream) if !upstream.endpoints.is_empty() => Ok(Some(upstream.to_resolver()?)),
            _ => Ok(None),
        }
    }

    pub fn credential_source(&self) -> Result<StaticCredentialSource, anyhow::Error> {
        let entries = self
            .credentials
            .iter()
            .map(CredentialConfig::resolve)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StaticCredentialSource::new(entries))
    }
}
