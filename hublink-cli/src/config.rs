//! Configuration file handling for the hublink CLI.

use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Broker and session configuration.
#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    /// Broker hostname, also used as the TLS server name
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Connect to this address instead of resolving `host`
    pub static_ip: Option<IpAddr>,

    /// Fall back to IPv6 when the broker has no IPv4 address
    #[serde(default)]
    pub allow_ipv6: bool,

    /// MQTT client identifier
    pub device_id: Option<String>,

    pub user_name: Option<String>,

    /// Keep-alive interval in seconds, 0 disables pings
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,

    /// Largest inbound payload accepted, in bytes
    #[serde(default = "default_payload_buffer")]
    pub payload_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_ip: None,
            allow_ipv6: false,
            device_id: None,
            user_name: None,
            keep_alive: default_keep_alive(),
            payload_buffer: default_payload_buffer(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8883
}

fn default_keep_alive() -> u16 {
    60
}

fn default_payload_buffer() -> usize {
    2048
}

/// TLS credentials.
#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    /// Credential tag the PEM files are installed under
    #[serde(default = "default_sec_tag")]
    pub sec_tag: u32,

    pub secondary_sec_tag: Option<u32>,

    /// Also trust the bundled Mozilla root certificates
    #[serde(default)]
    pub native_tls: bool,

    /// Path to the CA certificate (PEM format)
    pub ca_path: Option<String>,

    /// Path to the device certificate (PEM format)
    pub cert_path: Option<String>,

    /// Path to the device private key (PEM format)
    pub key_path: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            sec_tag: default_sec_tag(),
            secondary_sec_tag: None,
            native_tls: false,
            ca_path: None,
            cert_path: None,
            key_path: None,
        }
    }
}

fn default_sec_tag() -> u32 {
    10
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}
