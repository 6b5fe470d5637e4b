//! Broker address resolution.

use std::io;
use std::net::SocketAddr;

use tokio::net::lookup_host;
use tracing::{debug, error};

use crate::error::{HelperError, Result};
use crate::options::HelperSettings;

/// Resolve `hostname` into the address to dial.
///
/// A configured static IP skips the lookup entirely. Otherwise the first IPv4
/// result is used, with an IPv6 fallback only when the settings allow it.
/// The configured port is attached in both cases. Lookups are not retried.
pub async fn resolve(hostname: &str, settings: &HelperSettings) -> Result<SocketAddr> {
    if let Some(ip) = settings.static_ip {
        debug!("Using static IP address: {}", ip);
        return Ok(SocketAddr::new(ip, settings.port));
    }

    debug!("Resolving IP address for {}", hostname);

    let candidates = lookup_host((hostname, settings.port))
        .await
        .map_err(|source| {
            error!("Address lookup for {} failed: {}", hostname, source);
            HelperError::Resolution {
                host: hostname.to_string(),
                source,
            }
        })?;

    let addr = select_address(candidates, settings.allow_ipv6).ok_or_else(|| {
        error!("No usable address found for {}", hostname);
        HelperError::Resolution {
            host: hostname.to_string(),
            source: io::Error::new(io::ErrorKind::AddrNotAvailable, "no IPv4 address found"),
        }
    })?;

    debug!("Broker address found: {}", addr);

    Ok(addr)
}

fn select_address(
    candidates: impl IntoIterator<Item = SocketAddr>,
    allow_ipv6: bool,
) -> Option<SocketAddr> {
    let mut fallback = None;

    for addr in candidates {
        match addr {
            SocketAddr::V4(_) => return Some(addr),
            SocketAddr::V6(_) if allow_ipv6 && fallback.is_none() => fallback = Some(addr),
            SocketAddr::V6(_) => debug!("Skipping IPv6 address {}", addr),
        }
    }

    fallback
}
