//! TCP relay endpoint: handles `TcpDial` by resolving and connecting the
//! target, binding the socket to the requested tunnel and replying with a
//! dial status.
//!
//! | status | meaning |
//! |---|---|
//! | `0x00` | connected, tunnel registered |
//! | `0xF0` | malformed request or tunnel ID unusable |
//! | `0xF1` | target did not resolve |
//! | `0xF2` | connect failed or timed out |

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info, warn};

use mole_core::messages::{TcpDialPayload, TcpDialResultPayload};
use mole_core::relay::bind_stream;
use mole_core::{Connection, DialStatus, Envelope, MsgType, Tunnel, TunnelReceiver};

use crate::resolver;

/// A connected target bound to a registered tunnel, not yet relaying.
pub struct Dialed {
    pub tunnel: Arc<Tunnel>,
    pub sink: TunnelReceiver,
    pub stream: TcpStream,
}

/// Resolve and connect `req`'s target, then register its tunnel.
pub async fn dial(conn: &Connection, req: &TcpDialPayload, timeout: Duration) -> Result<Dialed, DialStatus> {
    let id = req.tunnel_id;
    if req.remote_host.is_empty() || req.remote_port == 0 || id == 0 {
        debug!(tunnel_id = id, "malformed dial request");
        return Err(DialStatus::Malformed);
    }

    let addrs = match time::timeout(timeout, resolver::resolve(&req.remote_host, req.remote_port)).await {
        Ok(Ok(addrs)) => addrs,
        Ok(Err(_)) | Err(_) => return Err(DialStatus::ResolveFailed),
    };

    let stream = match time::timeout(timeout, connect_any(&addrs)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(tunnel_id = id, host = %req.remote_host, port = req.remote_port, error = %e, "connect failed");
            return Err(DialStatus::ConnectFailed);
        }
        Err(_) => {
            debug!(tunnel_id = id, host = %req.remote_host, port = req.remote_port, "connect timed out");
            return Err(DialStatus::ConnectFailed);
        }
    };
    let _ = stream.set_nodelay(true);

    match conn.register_tunnel(id) {
        Ok((tunnel, sink)) => Ok(Dialed { tunnel, sink, stream }),
        Err(e) => {
            warn!(tunnel_id = id, error = %e, "cannot register dialed tunnel");
            Err(DialStatus::Malformed)
        }
    }
}

async fn connect_any(addrs: &[std::net::SocketAddr]) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address")))
}

/// Handle one `TcpDial` request end to end. Runs in its own task.
pub async fn handle_dial(conn: Arc<Connection>, request: Envelope, timeout: Duration) {
    let dialed = match request.decode::<TcpDialPayload>() {
        Ok(req) => dial(&conn, &req, timeout).await.map(|d| (req, d)),
        Err(e) => {
            debug!(error = %e, "undecodable dial request");
            Err(DialStatus::Malformed)
        }
    };

    let status = match &dialed {
        Ok(_) => DialStatus::Connected,
        Err(status) => *status,
    };
    let reply = TcpDialResultPayload {
        status_code: status.code(),
    };
    let sent = conn.respond(&request, MsgType::TcpDialResult, &reply).await;

    let Ok((req, dialed)) = dialed else {
        return;
    };
    let id = dialed.tunnel.id();
    if let Err(e) = sent {
        debug!(tunnel_id = id, error = %e, "dial result not sent");
        conn.discard_tunnel(id);
        return;
    }

    info!(tunnel_id = id, host = %req.remote_host, port = req.remote_port, "tcp tunnel connected");
    let relay = bind_stream(conn, dialed.tunnel, dialed.sink, dialed.stream);
    let (to, from) = relay.join().await;
    debug!(tunnel_id = id, to_tunnel = ?to, from_tunnel = ?from, "tcp relay finished");
}
