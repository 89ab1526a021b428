//! Target resolution via `tokio::net::lookup_host`.

use std::io;
use std::net::SocketAddr;
use tokio::net;
use tracing::{debug, warn};

/// Resolve `host:port` into socket addresses, IPv4 first.
///
/// An empty result is reported as an error so callers only deal with one
/// failure shape.
pub async fn resolve(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let mut addrs: Vec<SocketAddr> = match net::lookup_host((host, port)).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            warn!(host = %host, error = %e, "resolution failed");
            return Err(e);
        }
    };

    if addrs.is_empty() {
        debug!(host = %host, "no addresses found");
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {host}"),
        ));
    }

    addrs.sort_by_key(|a| !a.is_ipv4());
    debug!(host = %host, count = addrs.len(), "resolved");
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_literal_resolves_to_itself() {
        let addrs = resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn localhost_resolves() {
        let addrs = resolve("localhost", 80).await.unwrap();
        assert!(addrs.iter().all(|a| a.port() == 80));
        assert!(addrs.iter().any(|a| a.ip().is_loopback()));
    }

    #[tokio::test]
    async fn invalid_name_fails() {
        assert!(resolve("this-host-does-not-exist.invalid", 80).await.is_err());
    }
}
