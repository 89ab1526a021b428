//! Local TCP port forwarding through the agent.
//!
//! Every connection accepted on the local listener gets its own tunnel dialed
//! to the fixed remote target.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use mole_core::relay::bind_stream;

use crate::client::{MoleClient, TcpOpen};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Split `host:port`. IPv6 literals must be bracketed (`[::1]:22`).
pub fn parse_host_port(s: &str) -> io::Result<(String, u16)> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidInput, format!("{msg}: {s}"));

    let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
    if port == 0 {
        return Err(invalid("invalid port"));
    }
    Ok((host.to_string(), port))
}

pub struct PortForwarder {
    listener: TcpListener,
    remote_host: String,
    remote_port: u16,
}

impl PortForwarder {
    /// Listen on `local` and forward to `remote` (`host:port`).
    pub async fn bind(local: &str, remote: &str) -> io::Result<Self> {
        let (remote_host, remote_port) = parse_host_port(remote)?;
        let listener = TcpListener::bind(local).await?;
        info!(
            local = %listener.local_addr()?,
            remote = %remote,
            "port forward listening"
        );
        Ok(Self {
            listener,
            remote_host,
            remote_port,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the agent connection goes away.
    pub async fn run(&self, client: MoleClient) -> io::Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = client.closed() => {
                    info!("agent connection closed, port forward stopping");
                    return Ok(());
                }
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let client = client.clone();
            let host = self.remote_host.clone();
            let port = self.remote_port;
            tokio::spawn(async move {
                forward(&client, stream, peer, &host, port).await;
            });
        }
    }
}

async fn forward(client: &MoleClient, stream: TcpStream, peer: SocketAddr, host: &str, port: u16) {
    let _ = stream.set_nodelay(true);
    match client.open_tcp(host, port).await {
        Ok(TcpOpen::Connected(open)) => {
            debug!(peer = %peer, tunnel_id = open.id(), "forwarding");
            let relay = bind_stream(client.connection().clone(), open.tunnel, open.sink, stream);
            relay.join().await;
        }
        Ok(TcpOpen::Failed(status)) => {
            warn!(peer = %peer, host = %host, port, status = status.code(), "remote dial failed");
        }
        Err(e) => warn!(peer = %peer, error = %e, "could not open tunnel"),
    }
}
