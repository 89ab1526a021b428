//! SOCKS5 front end (RFC 1928, CONNECT only).
//!
//! Each accepted client socket goes through method negotiation and one
//! CONNECT request, then the target is dialed through a new tunnel on the
//! agent. The client gets a success reply only once the agent reports the
//! target connected; any other outcome yields a failure reply and the tunnel
//! is released.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use mole_core::relay::{bind_stream, RelayHandle};
use mole_core::{DialStatus, MoleError};

use crate::client::{MoleClient, TcpOpen};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// SOCKS5 version
pub const SOCKS_VERSION: u8 = 0x05;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = SocksError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(SocksError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Reply sent for a dial status reported by the agent.
    pub fn for_status(status: DialStatus) -> Self {
        match status {
            DialStatus::Connected => Reply::Succeeded,
            DialStatus::ResolveFailed => Reply::HostUnreachable,
            DialStatus::ConnectFailed => Reply::ConnectionRefused,
            DialStatus::Malformed | DialStatus::Unknown(_) => Reply::GeneralFailure,
        }
    }
}

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("invalid SOCKS version: {0}")]
    InvalidVersion(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableAuth,

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("domain name is not valid UTF-8")]
    InvalidDomain,

    #[error("dial failed with status 0x{:02x}", .0.code())]
    Dial(DialStatus),

    #[error("tunnel error: {0}")]
    Tunnel(#[from] MoleError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Destination requested by a SOCKS client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksTarget {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for SocksTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Reply with the placeholder bound address `0.0.0.0:0`.
fn make_reply(reply: Reply) -> [u8; 10] {
    [
        SOCKS_VERSION,
        reply as u8,
        0x00,
        AddressType::Ipv4 as u8,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

async fn write_reply<S>(stream: &mut S, reply: Reply) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&make_reply(reply)).await?;
    stream.flush().await
}

/// Run method negotiation and read the CONNECT request.
///
/// Every rejection after the greeting is answered on the wire before the
/// error is returned. No tunnel is involved yet.
pub async fn negotiate<S>(stream: &mut S) -> Result<SocksTarget, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting
    let mut buf = [0u8; 255];
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::InvalidVersion(head[0]));
    }

    let nmethods = head[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;
    let method = if buf[..nmethods].contains(&(AuthMethod::NoAuth as u8)) {
        AuthMethod::NoAuth
    } else {
        AuthMethod::NoAcceptable
    };
    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;
    stream.flush().await?;
    if method == AuthMethod::NoAcceptable {
        return Err(SocksError::NoAcceptableAuth);
    }

    // Request
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        write_reply(stream, Reply::GeneralFailure).await?;
        return Err(SocksError::InvalidVersion(request[0]));
    }

    match Command::try_from(request[1]) {
        Ok(Command::Connect) => {}
        Ok(other) => {
            write_reply(stream, Reply::CommandNotSupported).await?;
            return Err(SocksError::UnsupportedCommand(other as u8));
        }
        Err(e) => {
            write_reply(stream, Reply::CommandNotSupported).await?;
            return Err(e);
        }
    }

    // request[2] is reserved
    let host = match request[3] {
        t if t == AddressType::Ipv4 as u8 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        t if t == AddressType::Domain as u8 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let len = len[0] as usize;
            stream.read_exact(&mut buf[..len]).await?;
            match std::str::from_utf8(&buf[..len]) {
                Ok(host) => host.to_string(),
                Err(_) => {
                    write_reply(stream, Reply::GeneralFailure).await?;
                    return Err(SocksError::InvalidDomain);
                }
            }
        }
        other => {
            write_reply(stream, Reply::AddressTypeNotSupported).await?;
            return Err(SocksError::UnsupportedAddressType(other));
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok(SocksTarget {
        host,
        port: u16::from_be_bytes(port),
    })
}

/// Serve one SOCKS client: negotiate, dial through a tunnel, reply, relay.
pub async fn serve<S>(client: &MoleClient, mut stream: S) -> Result<RelayHandle, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let target = negotiate(&mut stream).await?;
    debug!(target = %target, "SOCKS5 CONNECT");

    let open = match client.open_tcp(&target.host, target.port).await {
        Ok(TcpOpen::Connected(open)) => open,
        Ok(TcpOpen::Failed(status)) => {
            write_reply(&mut stream, Reply::for_status(status)).await?;
            return Err(SocksError::Dial(status));
        }
        Err(e) => {
            write_reply(&mut stream, Reply::GeneralFailure).await?;
            return Err(e.into());
        }
    };

    if let Err(e) = write_reply(&mut stream, Reply::Succeeded).await {
        client.close_tunnel(open.id()).await;
        return Err(e.into());
    }

    let conn = client.connection().clone();
    Ok(bind_stream(conn, open.tunnel, open.sink, stream))
}

/// SOCKS5 listener bound to one agent session.
pub struct SocksServer {
    listener: TcpListener,
}

impl SocksServer {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "SOCKS5 server listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until the agent connection goes away.
    pub async fn run(&self, client: MoleClient) -> io::Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = client.closed() => {
                    info!("agent connection closed, SOCKS5 server stopping");
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
            debug!(peer = %peer, "SOCKS5 client accepted");

            let client = client.clone();
            tokio::spawn(async move {
                handle_client(&client, stream, peer).await;
            });
        }
    }
}

async fn handle_client(client: &MoleClient, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    match serve(client, stream).await {
        Ok(relay) => {
            let (to, from) = relay.join().await;
            debug!(peer = %peer, to_tunnel = ?to, from_tunnel = ?from, "SOCKS5 relay finished");
        }
        Err(SocksError::Dial(status)) => {
            debug!(peer = %peer, status = status.code(), "SOCKS5 target unreachable");
        }
        Err(e) => warn!(peer = %peer, error = %e, "SOCKS5 client failed"),
    }
}
