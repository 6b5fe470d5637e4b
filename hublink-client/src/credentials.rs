//! In-process credential store addressed by security tag.
//!
//! Credentials are installed once as PEM and looked up by tag whenever a TLS
//! client configuration is built.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, error};

use crate::error::{HelperError, Result};
use crate::options::Provisioning;

/// Identifies a group of credentials in a [`CredentialStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecTag(pub u32);

impl fmt::Display for SecTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of credential held under a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Trust anchor(s) used to verify the broker.
    CaCertificate,
    /// Private key of the device.
    PrivateKey,
    /// Certificate chain presented by the device.
    PublicCertificate,
}

#[derive(Default)]
struct TagCredentials {
    ca: Vec<CertificateDer<'static>>,
    key: Option<PrivateKeyDer<'static>>,
    chain: Vec<CertificateDer<'static>>,
}

/// Client identity found under a tag: certificate chain and private key.
pub(crate) type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

#[derive(Default)]
pub struct CredentialStore {
    tags: Mutex<HashMap<SecTag, TagCredentials>>,
    provisioned: AtomicBool,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `pem` and store it under `tag`, replacing any earlier credential
    /// of the same kind.
    pub fn install(&self, tag: SecTag, kind: CredentialKind, pem: &[u8]) -> Result<()> {
        let mut tags = self.tags.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = tags.entry(tag).or_default();

        match kind {
            CredentialKind::CaCertificate => entry.ca = parse_certs(pem, kind)?,
            CredentialKind::PublicCertificate => entry.chain = parse_certs(pem, kind)?,
            CredentialKind::PrivateKey => entry.key = Some(parse_private_key(pem)?),
        }

        debug!("Installed {:?} under sec tag {}", kind, tag);

        Ok(())
    }

    /// Install CA certificate, private key and device certificate under
    /// `tag`. Only the first successful call has any effect.
    pub fn provision(&self, tag: SecTag, material: &Provisioning) -> Result<()> {
        if self.provisioned.load(Ordering::Acquire) {
            return Ok(());
        }

        let steps = [
            (CredentialKind::CaCertificate, &material.ca_certificate),
            (CredentialKind::PrivateKey, &material.private_key),
            (CredentialKind::PublicCertificate, &material.device_certificate),
        ];

        for (kind, pem) in steps {
            self.install(tag, kind, pem).map_err(|e| {
                error!("Failed to register {:?}: {}", kind, e);
                e
            })?;
        }

        self.provisioned.store(true, Ordering::Release);

        Ok(())
    }

    /// Returns true once [`CredentialStore::provision`] has succeeded.
    pub fn is_provisioned(&self) -> bool {
        self.provisioned.load(Ordering::Acquire)
    }

    /// All CA certificates stored under any of `tags`.
    pub(crate) fn trust_anchors(&self, tags: &[SecTag]) -> Vec<CertificateDer<'static>> {
        let store = self.tags.lock().unwrap_or_else(PoisonError::into_inner);

        tags.iter()
            .filter_map(|tag| store.get(tag))
            .flat_map(|creds| creds.ca.iter().cloned())
            .collect()
    }

    /// The first complete client identity among `tags`, in order.
    pub(crate) fn identity(&self, tags: &[SecTag]) -> Option<Identity> {
        let store = self.tags.lock().unwrap_or_else(PoisonError::into_inner);

        tags.iter().filter_map(|tag| store.get(tag)).find_map(|creds| {
            match (&creds.key, creds.chain.is_empty()) {
                (Some(key), false) => Some((creds.chain.clone(), key.clone_key())),
                _ => None,
            }
        })
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags = self.tags.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = tags.keys().map(|tag| tag.0).collect();
        ids.sort_unstable();

        f.debug_struct("CredentialStore")
            .field("tags", &ids)
            .field("provisioned", &self.is_provisioned())
            .finish()
    }
}

fn parse_certs(pem: &[u8], kind: CredentialKind) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| HelperError::Credential(format!("Failed to parse {:?}: {}", kind, e)))?;

    if certs.is_empty() {
        return Err(HelperError::Credential(format!(
            "No certificates found in {:?} PEM",
            kind
        )));
    }

    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = pem;

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Ok(PrivateKeyDer::Sec1(key)),
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                return Err(HelperError::Credential(format!(
                    "Failed to parse private key: {}",
                    e
                )))
            }
        }
    }

    Err(HelperError::Credential("No private key found in PEM".into()))
}
