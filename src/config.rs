//! Configuration module for mtrelay
//!
//! JSON configuration with serde defaults. Every knob has a documented
//! default; the only required field is the secret.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::secret::Secret;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shared secret, `ee`-hex or base64url form.
    pub secret: String,

    /// Listen address for client connections.
    #[serde(default = "default_bind_to")]
    pub bind_to: SocketAddr,

    /// Port used when splicing unrecognized clients to the fronting host.
    /// The host itself comes from the secret.
    #[serde(default = "default_fronting_port")]
    pub domain_fronting_port: u16,

    /// Address family preference when dialing datacenters.
    #[serde(default)]
    pub prefer_ip: PreferIp,

    /// Reroute clients asking for an unknown DC to the default pool instead
    /// of treating the handshake as unrecognized.
    #[serde(default)]
    pub allow_fallback_on_unknown_dc: bool,

    /// Maximum accepted clock difference, in seconds, for the upstream's
    /// first reply. 0 disables the check.
    #[serde(default)]
    pub tolerate_time_skewness: u64,

    /// Route to the staging datacenters instead of production.
    #[serde(default)]
    pub use_test_dcs: bool,

    /// Cap on simultaneously relayed connections.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub defense: DefenseConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    /// Verbose logging.
    #[serde(default)]
    pub debug: bool,
}

/// Address family preference for upstream dialing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PreferIp {
    #[serde(rename = "ipv4")]
    Ipv4,
    #[serde(rename = "ipv6")]
    Ipv6,
    #[serde(rename = "prefer-ipv4")]
    PreferIpv4,
    #[default]
    #[serde(rename = "prefer-ipv6")]
    PreferIpv6,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DefenseConfig {
    #[serde(default)]
    pub anti_replay: AntiReplayConfig,

    #[serde(default)]
    pub blocklist: IpListConfig,

    #[serde(default)]
    pub allowlist: IpListConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiReplayConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Filter memory budget in bytes.
    #[serde(default = "default_antireplay_max_size")]
    pub max_size: usize,

    /// Acceptable false-positive rate.
    #[serde(default = "default_antireplay_error_rate")]
    pub error_rate: f64,
}

impl Default for AntiReplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: default_antireplay_max_size(),
            error_rate: default_antireplay_error_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpListConfig {
    #[serde(default)]
    pub enabled: bool,

    /// firehol-format list files.
    #[serde(default)]
    pub files: Vec<String>,

    /// Refresh interval in seconds.
    #[serde(default = "default_list_update_each")]
    pub update_each: u64,
}

impl Default for IpListConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            files: Vec::new(),
            update_each: default_list_update_each(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Upstream dial timeout in seconds.
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout: u64,

    /// Deadline for the client's 64 handshake bytes, in seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,

    /// Cancel a relayed connection after this many seconds without traffic.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tcp_timeout: default_tcp_timeout(),
            handshake_timeout: default_handshake_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl NetworkConfig {
    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatsConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_prometheus_listen")]
    pub listen: SocketAddr,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_prometheus_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints and the secret itself.
    pub fn validate(&self) -> Result<()> {
        self.parsed_secret()?;
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be positive".into()));
        }
        if self.defense.anti_replay.enabled {
            let rate = self.defense.anti_replay.error_rate;
            if !(rate > 0.0 && rate < 1.0) {
                return Err(Error::Config(
                    "defense.anti_replay.error_rate must be in (0, 1)".into(),
                ));
            }
            if self.defense.anti_replay.max_size == 0 {
                return Err(Error::Config(
                    "defense.anti_replay.max_size must be positive".into(),
                ));
            }
        }
        for (name, list) in [
            ("blocklist", &self.defense.blocklist),
            ("allowlist", &self.defense.allowlist),
        ] {
            if list.enabled && list.files.is_empty() {
                return Err(Error::Config(format!(
                    "defense.{} is enabled but has no files",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn parsed_secret(&self) -> Result<Secret> {
        Secret::parse(&self.secret)
    }

    /// Create a default configuration around a freshly generated secret.
    pub fn default_with_secret(secret: &Secret) -> Self {
        Config {
            secret: secret.to_hex(),
            bind_to: default_bind_to(),
            domain_fronting_port: default_fronting_port(),
            prefer_ip: PreferIp::default(),
            allow_fallback_on_unknown_dc: false,
            tolerate_time_skewness: 0,
            use_test_dcs: false,
            concurrency: default_concurrency(),
            defense: DefenseConfig {
                anti_replay: AntiReplayConfig {
                    enabled: true,
                    ..Default::default()
                },
                ..Default::default()
            },
            network: NetworkConfig::default(),
            stats: StatsConfig::default(),
            debug: false,
        }
    }
}

fn default_bind_to() -> SocketAddr {
    "0.0.0.0:3128".parse().expect("static address")
}

fn default_fronting_port() -> u16 {
    443
}

fn default_concurrency() -> usize {
    4096
}

fn default_antireplay_max_size() -> usize {
    1024 * 1024
}

fn default_antireplay_error_rate() -> f64 {
    0.001
}

fn default_list_update_each() -> u64 {
    3600
}

fn default_tcp_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_prometheus_listen() -> SocketAddr {
    "127.0.0.1:9090".parse().expect("static address")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "ee000102030405060708090a0b0c0d0e0f6578616d706c652e636f6d";

    #[test]
    fn test_minimal_config() {
        let config = Config::from_json(&format!(r#"{{"secret": "{}"}}"#, SECRET)).unwrap();
        assert_eq!(config.domain_fronting_port, 443);
        assert_eq!(config.prefer_ip, PreferIp::PreferIpv6);
        assert_eq!(config.concurrency, 4096);
        assert!(!config.defense.anti_replay.enabled);
        assert_eq!(config.network.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.parsed_secret().unwrap().host, "example.com");
    }

    #[test]
    fn test_rejects_bad_secret() {
        assert!(Config::from_json(r#"{"secret": "zz"}"#).is_err());
    }

    #[test]
    fn test_rejects_missing_secret() {
        assert!(Config::from_json(r#"{}"#).is_err());
    }

    #[test]
    fn test_rejects_enabled_list_without_files() {
        let json = format!(
            r#"{{"secret": "{}", "defense": {{"blocklist": {{"enabled": true}}}}}}"#,
            SECRET
        );
        assert!(Config::from_json(&json).is_err());
    }

    #[test]
    fn test_full_config() {
        let json = format!(
            r#"{{
                "secret": "{}",
                "bind_to": "127.0.0.1:8443",
                "prefer_ip": "ipv4",
                "allow_fallback_on_unknown_dc": true,
                "tolerate_time_skewness": 30,
                "concurrency": 128,
                "defense": {{
                    "anti_replay": {{"enabled": true, "max_size": 65536, "error_rate": 0.01}},
                    "blocklist": {{"enabled": true, "files": ["/tmp/deny.netset"], "update_each": 60}}
                }},
                "network": {{"tcp_timeout": 5, "handshake_timeout": 3, "idle_timeout": 120}},
                "stats": {{"prometheus": {{"enabled": true, "listen": "127.0.0.1:9100"}}}},
                "debug": true
            }}"#,
            SECRET
        );
        let config = Config::from_json(&json).unwrap();
        assert_eq!(config.prefer_ip, PreferIp::Ipv4);
        assert!(config.allow_fallback_on_unknown_dc);
        assert_eq!(config.tolerate_time_skewness, 30);
        assert_eq!(config.concurrency, 128);
        assert_eq!(config.defense.blocklist.update_each, 60);
        assert_eq!(config.network.tcp_timeout(), Duration::from_secs(5));
        assert!(config.stats.prometheus.enabled);
    }

    #[test]
    fn test_default_with_secret_roundtrips() {
        let secret = Secret::generate("cdn.example.net").unwrap();
        let config = Config::default_with_secret(&secret);
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.parsed_secret().unwrap(), secret);
        assert!(parsed.defense.anti_replay.enabled);
    }
}
