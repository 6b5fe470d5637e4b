//! TLS client configuration built from the credential store.

use std::io;
use std::sync::Arc;

use rustls::client::Resumption;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

use crate::credentials::{CredentialStore, SecTag};
use crate::error::{HelperError, Result};

/// Build a client configuration from the credentials stored under `tags`.
///
/// The broker certificate is always verified. Trust anchors are every CA
/// stored under any tag, plus the bundled Mozilla roots when `native_tls` is
/// set. The first tag holding both a key and a certificate chain supplies the
/// client identity. Session resumption is disabled.
pub fn build_client_config(
    store: &CredentialStore,
    tags: &[SecTag],
    native_tls: bool,
) -> Result<Arc<ClientConfig>> {
    let mut root_store = if native_tls {
        RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
    } else {
        RootCertStore::empty()
    };

    for cert in store.trust_anchors(tags) {
        root_store
            .add(cert)
            .map_err(|e| HelperError::Credential(format!("Failed to add CA cert: {}", e)))?;
    }

    if root_store.is_empty() {
        warn!("No trust anchors under sec tags {:?}, handshakes will fail", tags);
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let mut config = match store.identity(tags) {
        Some((chain, key)) => {
            debug!("Presenting client certificate ({} in chain)", chain.len());
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| HelperError::Credential(format!("Invalid client identity: {}", e)))?
        }
        None => builder.with_no_client_auth(),
    };

    config.resumption = Resumption::disabled();

    Ok(Arc::new(config))
}

/// TLS server name for `host`, which may also be an IP literal.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|e| HelperError::Resolution {
        host: host.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::self_signed;
    use crate::credentials::CredentialKind;

    #[test]
    fn test_config_with_client_identity() {
        let store = CredentialStore::new();
        store.provision(SecTag(10), &self_signed()).unwrap();

        let config = build_client_config(&store, &[SecTag(10)], false).unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_config_without_identity() {
        let material = self_signed();
        let store = CredentialStore::new();
        store
            .install(SecTag(1), CredentialKind::CaCertificate, &material.ca_certificate)
            .unwrap();

        let config = build_client_config(&store, &[SecTag(1), SecTag(2)], false).unwrap();
        assert!(!config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_native_roots_without_credentials() {
        let store = CredentialStore::new();
        assert!(build_client_config(&store, &[SecTag(10)], true).is_ok());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("broker.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(matches!(
            server_name("not a host name"),
            Err(HelperError::Resolution { .. })
        ));
    }
}
