use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub upstream: UpstreamConfig,
    /// Logins exempt from second-factor enforcement (compared case-insensitively).
    #[serde(default)]
    pub service_accounts: Vec<String>,
    pub second_factor: SecondFactorConfig,
    pub tls: Option<TlsConfig>,
    /// Optional HTTP listen address for metrics and health (e.g. "0.0.0.0:9090").
    /// Endpoints: GET /metrics (Prometheus), GET /health (liveness).
    pub metrics_listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Directory server URI: ldap://host:port or ldaps://host:port.
    pub uri: String,
    /// Connect timeout in seconds (default 5).
    pub connect_timeout_sec: Option<u64>,
    /// For ldaps:// upstreams: do not verify the server certificate
    /// (tests / internal networks only).
    pub tls_skip_verify: Option<bool>,
    /// PEM CA or bundle for verifying the ldaps:// upstream, in addition to
    /// system roots.
    pub tls_ca_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondFactorConfig {
    /// Endpoint of the second-factor service, e.g. "http://127.0.0.1:4242/api/authenticate".
    pub url: String,
    /// Call timeout in seconds (default 10). Timeout means deny.
    pub timeout_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig {
                url: "ldap://127.0.0.1:1389".to_string(),
            },
            upstream: UpstreamConfig {
                uri: "ldap://127.0.0.1:389".to_string(),
                connect_timeout_sec: Some(5),
                tls_skip_verify: None,
                tls_ca_file: None,
            },
            service_accounts: vec![],
            second_factor: SecondFactorConfig {
                url: "http://127.0.0.1:4242/api/authenticate".to_string(),
                timeout_sec: Some(10),
            },
            tls: None,
            metrics_listen: None,
        }
    }
}
