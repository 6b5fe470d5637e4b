//! Transport setup: resolution, TLS configuration and the CONNECT handshake.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialStore;
use crate::error::{HelperError, Result};
use crate::options::{ConnParams, HelperSettings};
use crate::resolver::resolve;
use crate::session::{BoxedStream, Inbound, Outbound};
use crate::tls::{build_client_config, server_name};

/// Everything needed to reach the broker for one connection attempt.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    pub(crate) broker: SocketAddr,
    pub(crate) server_name: ServerName<'static>,
    pub(crate) client_id: String,
    pub(crate) user_name: Option<String>,
    pub(crate) tls: Arc<ClientConfig>,
    pub(crate) connect_timeout: Duration,
}

impl TransportHandle {
    pub fn broker(&self) -> SocketAddr {
        self.broker
    }

    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    pub fn tls_config(&self) -> Arc<ClientConfig> {
        self.tls.clone()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

/// Opens the byte stream a session runs over.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, handle: &TransportHandle) -> io::Result<BoxedStream>;
}

/// TCP connect followed by a TLS handshake, both under the connect timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct TlsDialer;

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, handle: &TransportHandle) -> io::Result<BoxedStream> {
        let connector = TlsConnector::from(handle.tls_config());

        let handshake = async {
            let tcp = TcpStream::connect(handle.broker).await?;
            tcp.set_nodelay(true)?;
            connector.connect(handle.server_name.clone(), tcp).await
        };

        let stream = timeout(handle.connect_timeout, handshake)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        Ok(Box::new(stream))
    }
}

pub(crate) struct Connector {
    settings: HelperSettings,
    credentials: Arc<CredentialStore>,
    dialer: Arc<dyn Dialer>,
}

impl Connector {
    pub(crate) fn new(
        settings: HelperSettings,
        credentials: Arc<CredentialStore>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            settings,
            credentials,
            dialer,
        }
    }

    pub(crate) fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Provision credentials if configured, resolve the broker and build the
    /// TLS configuration.
    pub(crate) async fn build(&self, params: &ConnParams) -> Result<TransportHandle> {
        if let Some(material) = &self.settings.provisioning {
            self.credentials.provision(self.settings.sec_tag, material)?;
        }

        let broker = resolve(&params.hostname, &self.settings).await?;

        let mut tags = vec![self.settings.sec_tag];
        tags.extend(self.settings.secondary_sec_tag);
        let tls = build_client_config(&self.credentials, &tags, self.settings.native_tls)?;

        let user_name = Some(params.user_name.clone()).filter(|name| !name.is_empty());

        Ok(TransportHandle {
            broker,
            server_name: server_name(&params.hostname)?,
            client_id: params.device_id.clone(),
            user_name,
            tls,
            connect_timeout: self.settings.connect_timeout_duration(),
        })
    }

    /// Dial, split the stream and send CONNECT.
    pub(crate) async fn connect(&self, handle: &TransportHandle) -> Result<(Inbound, Outbound)> {
        debug!("Connecting to {}", handle.broker);

        let stream = self.dialer.dial(handle).await.map_err(|e| {
            error!("Failed to connect to {}: {}", handle.broker, e);
            HelperError::Connect(e)
        })?;

        let (reader, writer) = tokio::io::split(stream);
        let inbound = Inbound::new(reader, &self.settings);
        let mut outbound = Outbound::new(writer, &self.settings);

        let handshake = outbound.connect(&handle.client_id, handle.user_name.as_deref());
        timeout(handle.connect_timeout, handshake)
            .await
            .unwrap_or_else(|_| {
                Err(io::Error::new(io::ErrorKind::TimedOut, "CONNECT send timed out").into())
            })
            .map_err(|e| {
                error!("Failed to send CONNECT to {}: {}", handle.broker, e);
                match e {
                    HelperError::Io(io) => HelperError::Connect(io),
                    other => other,
                }
            })?;

        if let Some(limit) = self.settings.send_timeout_duration() {
            if let Err(e) = outbound.set_send_timeout(Some(limit)) {
                warn!("Failed to set send timeout: {}", e);
            }
        }

        info!("Transport connected to {}", handle.broker);

        Ok((inbound, outbound))
    }
}
