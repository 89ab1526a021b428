//! Operator-side mole client.
//!
//! Wraps one [`Connection`] to a mole agent: performs the `Hello` handshake,
//! then asks the agent for tunnels and binds them to TCP targets or shells.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info, warn};

use mole_core::messages::{
    HelloOkPayload, HelloPayload, ShellOpenPayload, ShellOpenedPayload, TcpDialPayload,
    TcpDialResultPayload, TunnelClosePayload, TunnelOpenPayload, TunnelOpenedPayload,
};
use mole_core::{
    Connection, ConnectionConfig, DialStatus, Dispatcher, Envelope, MoleError, MoleResult,
    MsgType, Tunnel, TunnelReceiver, PROTOCOL_VERSION,
};

/// Configuration for [`MoleClient::connect`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Limit for the TCP connect and the `Hello` exchange.
    pub connect_timeout: Duration,
    /// Settings for the underlying connection.
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            connection: ConnectionConfig::default(),
        }
    }
}

/// A tunnel registered on the client side, plus the queue of bytes the agent
/// sends over it.
#[derive(Debug)]
pub struct OpenTunnel {
    pub tunnel: Arc<Tunnel>,
    pub sink: TunnelReceiver,
}

impl OpenTunnel {
    pub fn id(&self) -> u64 {
        self.tunnel.id()
    }
}

/// Outcome of [`MoleClient::open_tcp`].
#[derive(Debug)]
pub enum TcpOpen {
    Connected(OpenTunnel),
    /// The agent could not reach the target; the tunnel has been released.
    Failed(DialStatus),
}

/// A remote shell bound to a tunnel.
#[derive(Debug)]
pub struct ShellSession {
    pub tunnel: OpenTunnel,
    pub pid: Option<u32>,
    pub path: String,
}

/// The mole client.
#[derive(Debug, Clone)]
pub struct MoleClient {
    conn: Arc<Connection>,
    session_id: u64,
}

impl MoleClient {
    /// Connect to an agent at `addr` (`host:port`) and perform the handshake.
    pub async fn connect(addr: &str, config: ClientConfig) -> MoleResult<Self> {
        let stream = match time::timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(MoleError::Timeout),
        };
        stream.set_nodelay(true)?;
        info!(addr = %addr, "connected to agent");
        Self::from_stream(stream, config).await
    }

    /// Run the handshake over an already established byte stream.
    pub async fn from_stream<S>(stream: S, config: ClientConfig) -> MoleResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Connection::start(stream, config.connection, Dispatcher::new());
        let hello = HelloPayload {
            version: PROTOCOL_VERSION.to_string(),
        };
        let response = match time::timeout(
            config.connect_timeout,
            conn.request(MsgType::Hello, &hello),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => Err(MoleError::Timeout),
        };
        let response = match response {
            Ok(env) => env,
            Err(e) => {
                conn.shutdown();
                return Err(e);
            }
        };

        let ok: HelloOkPayload = response.decode()?;
        if ok.version != PROTOCOL_VERSION {
            conn.shutdown();
            return Err(MoleError::Protocol(format!(
                "agent speaks {}, expected {PROTOCOL_VERSION}",
                ok.version
            )));
        }
        debug!(session_id = ok.session_id, "handshake complete");

        Ok(Self {
            conn,
            session_id: ok.session_id,
        })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn is_connected(&self) -> bool {
        !self.conn.is_closed()
    }

    /// Ask the agent for a new tunnel ID and register the tunnel locally.
    pub async fn open_tunnel(&self) -> MoleResult<OpenTunnel> {
        let response = self
            .conn
            .request(
                MsgType::TunnelOpen,
                &TunnelOpenPayload {
                    session_id: self.session_id,
                },
            )
            .await?;
        let opened: TunnelOpenedPayload = response.decode()?;
        if opened.tunnel_id == 0 {
            return Err(MoleError::Protocol("agent allocated tunnel id 0".into()));
        }

        let (tunnel, sink) = self.conn.register_tunnel(opened.tunnel_id)?;
        debug!(tunnel_id = opened.tunnel_id, "tunnel opened");
        Ok(OpenTunnel { tunnel, sink })
    }

    /// Ask the agent to connect tunnel `tunnel_id` to `host:port`.
    pub async fn dial(&self, tunnel_id: u64, host: &str, port: u16) -> MoleResult<DialStatus> {
        let payload = TcpDialPayload {
            remote_host: host.to_string(),
            remote_port: port,
            tunnel_id,
        };
        let response = self.conn.request(MsgType::TcpDial, &payload).await?;
        let result: TcpDialResultPayload = response.decode()?;
        Ok(DialStatus::from(result.status_code))
    }

    /// Open a tunnel and dial `host:port` through it. On any failure the
    /// tunnel is released before returning.
    pub async fn open_tcp(&self, host: &str, port: u16) -> MoleResult<TcpOpen> {
        let open = self.open_tunnel().await?;
        let id = open.id();

        match self.dial(id, host, port).await {
            Ok(status) if status.is_connected() => {
                info!(tunnel_id = id, host = %host, port, "tunnel connected");
                Ok(TcpOpen::Connected(open))
            }
            Ok(status) => {
                debug!(tunnel_id = id, host = %host, port, status = status.code(), "dial failed");
                self.release_tunnel(id).await;
                Ok(TcpOpen::Failed(status))
            }
            Err(e) => {
                self.release_tunnel(id).await;
                Err(e)
            }
        }
    }

    /// Start a shell on the agent bound to a new tunnel.
    pub async fn open_shell(&self, path: Option<String>, pty: bool) -> MoleResult<ShellSession> {
        let open = self.open_tunnel().await?;
        let id = open.id();
        let payload = ShellOpenPayload {
            tunnel_id: id,
            path,
            pty,
        };

        let opened: ShellOpenedPayload = match self.conn.request(MsgType::ShellOpen, &payload).await {
            Ok(response) => match response.decode() {
                Ok(opened) => opened,
                Err(e) => {
                    self.release_tunnel(id).await;
                    return Err(e);
                }
            },
            Err(e) => {
                self.release_tunnel(id).await;
                return Err(e);
            }
        };
        info!(tunnel_id = id, path = %opened.path, pid = ?opened.pid, "shell opened");

        Ok(ShellSession {
            tunnel: open,
            pid: opened.pid,
            path: opened.path,
        })
    }

    /// Drop a tunnel the agent never bound (or failed to bind) and tell the
    /// agent to forget it.
    pub async fn release_tunnel(&self, tunnel_id: u64) {
        self.conn.discard_tunnel(tunnel_id);
        let notice = match Envelope::new(MsgType::TunnelClose, 0, &TunnelClosePayload { tunnel_id }) {
            Ok(env) => env,
            Err(e) => {
                warn!(tunnel_id, error = %e, "could not encode tunnel close");
                return;
            }
        };
        if let Err(e) = self.conn.writer().send_envelope(notice).await {
            debug!(tunnel_id, error = %e, "tunnel close not sent");
        }
    }

    /// Close a bound tunnel from this side.
    pub async fn close_tunnel(&self, tunnel_id: u64) -> bool {
        self.conn.close_tunnel(tunnel_id).await
    }

    /// Tear down the connection and every tunnel on it.
    pub fn disconnect(&self) {
        self.conn.shutdown();
    }

    /// Resolves when the connection to the agent is gone.
    pub async fn closed(&self) {
        self.conn.closed().await
    }
}
