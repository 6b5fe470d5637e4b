//! Shared utilities for the hublink subcommands.

use std::path::PathBuf;

use clap::Args;
use hublink_client::{
    ConnParams, CredentialKind, HelperSettings, MqttHelper, Provisioning, QoS, SecTag,
};

use crate::config::Config;

/// Connection arguments shared between the pub and sub commands. Flags
/// override values from the configuration file.
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Broker hostname
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Broker port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Device ID, sent as the MQTT client identifier
    #[arg(short = 'i', long)]
    pub device_id: Option<String>,

    /// User name for authentication
    #[arg(short = 'u', long)]
    pub user_name: Option<String>,

    /// Keep-alive interval in seconds
    #[arg(short = 'k', long)]
    pub keep_alive: Option<u16>,

    /// CA certificate (PEM)
    #[arg(long)]
    pub cafile: Option<String>,

    /// Device certificate (PEM)
    #[arg(long)]
    pub cert: Option<String>,

    /// Device private key (PEM)
    #[arg(long)]
    pub key: Option<String>,

    /// Also trust the bundled Mozilla root certificates
    #[arg(long)]
    pub native_tls: bool,

    /// Enable verbose output
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Everything a subcommand needs to bring up a connection.
pub struct Session {
    pub settings: HelperSettings,
    pub params: ConnParams,
    pub log_level: String,
    sec_tag: SecTag,
    ca_only: Option<Vec<u8>>,
}

impl ConnectionArgs {
    /// Merge the configuration file and the flags.
    pub fn load(&self) -> Result<Session, Box<dyn std::error::Error>> {
        let config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        let broker = config.broker;
        let tls = config.tls;

        let host = self.host.clone().unwrap_or(broker.host);
        let device_id = self
            .device_id
            .clone()
            .or(broker.device_id)
            .unwrap_or_else(|| format!("hublink-{}", std::process::id()));
        let user_name = self.user_name.clone().or(broker.user_name).unwrap_or_default();

        let sec_tag = SecTag(tls.sec_tag);
        let mut settings = HelperSettings::new()
            .port(self.port.unwrap_or(broker.port))
            .allow_ipv6(broker.allow_ipv6)
            .keep_alive(self.keep_alive.unwrap_or(broker.keep_alive))
            .payload_buffer_len(broker.payload_buffer)
            .sec_tag(sec_tag)
            .native_tls(self.native_tls || tls.native_tls);

        if let Some(ip) = broker.static_ip {
            settings = settings.static_ip(ip);
        }
        if let Some(tag) = tls.secondary_sec_tag {
            settings = settings.secondary_sec_tag(SecTag(tag));
        }

        let ca_path = self.cafile.clone().or(tls.ca_path);
        let cert_path = self.cert.clone().or(tls.cert_path);
        let key_path = self.key.clone().or(tls.key_path);

        let mut ca_only = None;
        match (ca_path, cert_path, key_path) {
            (Some(ca), Some(cert), Some(key)) => {
                settings = settings.provisioning(Provisioning {
                    ca_certificate: read_pem(&ca)?,
                    private_key: read_pem(&key)?,
                    device_certificate: read_pem(&cert)?,
                });
            }
            (Some(ca), None, None) => ca_only = Some(read_pem(&ca)?),
            (None, None, None) => {}
            _ => return Err("--cert and --key must be given together with --cafile".into()),
        }

        Ok(Session {
            settings,
            params: ConnParams::new(host, device_id).user_name(user_name),
            log_level: config.logging.level,
            sec_tag,
            ca_only,
        })
    }
}

impl Session {
    /// Create the helper and install a standalone CA certificate if one was
    /// given without a device identity.
    pub fn helper(&self) -> Result<MqttHelper, Box<dyn std::error::Error>> {
        let helper = MqttHelper::new(self.settings.clone());

        if let Some(ca) = &self.ca_only {
            helper
                .credentials()
                .install(self.sec_tag, CredentialKind::CaCertificate, ca)?;
        }

        Ok(helper)
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    std::fs::read(path).map_err(|e| format!("Failed to read '{}': {}", path, e).into())
}

pub fn parse_qos(qos: u8) -> Result<QoS, Box<dyn std::error::Error>> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        _ => Err(format!("Invalid QoS level: {}. Must be 0, 1, or 2.", qos).into()),
    }
}

/// Initialize tracing/logging based on verbosity and the configured level.
pub fn init_logging(verbose: bool, level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        connection: ConnectionArgs,
    }

    #[test]
    fn test_flags_without_config() {
        let cli = TestCli::parse_from([
            "hublink",
            "-H",
            "hub.example.com",
            "-i",
            "device-1",
            "-k",
            "30",
        ]);
        let session = cli.connection.load().unwrap();

        assert_eq!(session.params.hostname(), "hub.example.com");
        assert_eq!(session.params.device_id(), "device-1");
        assert_eq!(session.log_level, "warn");
        assert!(session.ca_only.is_none());
    }

    #[test]
    fn test_cert_without_ca_is_rejected() {
        let cli = TestCli::parse_from(["hublink", "--cert", "device.pem"]);
        assert!(cli.connection.load().is_err());
    }

    #[test]
    fn test_parse_qos() {
        assert_eq!(parse_qos(1).unwrap(), QoS::AtLeastOnce);
        assert!(parse_qos(3).is_err());
    }
}
