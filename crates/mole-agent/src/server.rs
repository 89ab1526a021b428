//! Core agent: accepts operator connections and builds the handler table for
//! each one.
//!
//! Every accepted connection gets a random session ID returned in `HelloOk`;
//! `TunnelOpen` requests must quote it. Tunnel IDs are allocated here and
//! registered only once a dial or shell spawn succeeds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use mole_core::messages::{
    error_code, HelloOkPayload, HelloPayload, TunnelOpenPayload, TunnelOpenedPayload,
};
use mole_core::{Connection, Dispatcher, Envelope, MoleResult, MsgType, PROTOCOL_VERSION};

use crate::config::AgentConfig;
use crate::{shell, tcp};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-connection handshake state.
struct Session {
    id: u64,
    greeted: AtomicBool,
}

/// The mole agent.
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> MoleResult<TcpListener> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        info!(addr = %listener.local_addr()?, "agent listening");
        Ok(listener)
    }

    /// Accept connections forever.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> MoleResult<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "set_nodelay failed");
            }
            info!(peer = %peer, "operator connected");
            let agent = self.clone();
            tokio::spawn(async move {
                let conn = agent.serve(stream);
                conn.closed().await;
                info!(peer = %peer, "operator disconnected");
            });
        }
    }

    /// Start serving one operator connection over `stream`.
    pub fn serve<S>(self: &Arc<Self>, stream: S) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = Arc::new(Session {
            id: random_nonzero(),
            greeted: AtomicBool::new(false),
        });
        let dispatcher = self.dispatcher(session);
        Connection::start(stream, self.config.connection_config(), dispatcher)
    }

    fn dispatcher(self: &Arc<Self>, session: Arc<Session>) -> Dispatcher {
        let hello_session = session.clone();
        let open_session = session.clone();
        let dial_session = session.clone();
        let dial_timeout = self.config.dial_timeout;
        let shell = self.config.shell.clone();

        Dispatcher::new()
            .on(MsgType::Hello, move |conn, env| {
                let conn = conn.clone();
                let session = hello_session.clone();
                tokio::spawn(async move { handle_hello(&conn, env, &session).await });
            })
            .on(MsgType::TunnelOpen, move |conn, env| {
                let conn = conn.clone();
                let session = open_session.clone();
                tokio::spawn(async move { handle_tunnel_open(&conn, env, &session).await });
            })
            .on(MsgType::TcpDial, move |conn, env| {
                if dial_session.is_greeted() {
                    tokio::spawn(tcp::handle_dial(conn.clone(), env, dial_timeout));
                } else {
                    reject_ungreeted(conn, env);
                }
            })
            .on(MsgType::ShellOpen, move |conn, env| {
                if session.is_greeted() {
                    tokio::spawn(shell::handle_open(conn.clone(), env, shell.clone()));
                } else {
                    reject_ungreeted(conn, env);
                }
            })
    }
}

impl Session {
    fn is_greeted(&self) -> bool {
        self.greeted.load(Ordering::Acquire)
    }
}

/// Answer a request that arrived before the `Hello` exchange.
fn reject_ungreeted(conn: &Arc<Connection>, env: Envelope) {
    warn!(msg_type = ?env.msg_type, "request before handshake rejected");
    let conn = conn.clone();
    tokio::spawn(async move {
        if let Err(e) = conn
            .respond_error(env.id, error_code::BAD_SESSION, "handshake required")
            .await
        {
            debug!(error = %e, "rejection not sent");
        }
    });
}

async fn handle_hello(conn: &Connection, env: Envelope, session: &Session) {
    let result = match env.decode::<HelloPayload>() {
        Ok(hello) if hello.version == PROTOCOL_VERSION => {
            session.greeted.store(true, Ordering::Release);
            debug!(session_id = session.id, "handshake complete");
            let ok = HelloOkPayload {
                session_id: session.id,
                version: PROTOCOL_VERSION.to_string(),
            };
            conn.respond(&env, MsgType::HelloOk, &ok).await
        }
        Ok(hello) => {
            warn!(version = %hello.version, "unsupported protocol version");
            conn.respond_error(
                env.id,
                error_code::MALFORMED,
                format!("unsupported version {}", hello.version),
            )
            .await
        }
        Err(e) => conn.respond_error(env.id, error_code::MALFORMED, e.to_string()).await,
    };
    if let Err(e) = result {
        debug!(error = %e, "hello reply not sent");
    }
}

async fn handle_tunnel_open(conn: &Connection, env: Envelope, session: &Session) {
    let result = match env.decode::<TunnelOpenPayload>() {
        Ok(req) if session.is_greeted() && req.session_id == session.id => {
            let tunnel_id = allocate_tunnel_id(conn);
            debug!(tunnel_id, "tunnel id allocated");
            let opened = TunnelOpenedPayload {
                tunnel_id,
                session_id: session.id,
            };
            conn.respond(&env, MsgType::TunnelOpened, &opened).await
        }
        Ok(req) => {
            warn!(session_id = req.session_id, "tunnel requested for unknown session");
            conn.respond_error(env.id, error_code::BAD_SESSION, "unknown session")
                .await
        }
        Err(e) => conn.respond_error(env.id, error_code::MALFORMED, e.to_string()).await,
    };
    if let Err(e) = result {
        debug!(error = %e, "tunnel open reply not sent");
    }
}

fn random_nonzero() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

/// A random non-zero ID not currently registered on `conn`.
fn allocate_tunnel_id(conn: &Connection) -> u64 {
    loop {
        let id = random_nonzero();
        if !conn.registry().contains(id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mole_core::messages::{ErrorPayload, ShellOpenPayload, TcpDialPayload};
    use mole_core::ConnectionConfig;

    async fn agent_pair() -> (Arc<Connection>, Arc<Connection>) {
        let agent = Agent::new(AgentConfig::default());
        let (a, b) = tokio::io::duplex(64 * 1024);
        let agent_conn = agent.serve(a);
        let client_conn = Connection::start(b, ConnectionConfig::default(), Dispatcher::new());
        (agent_conn, client_conn)
    }

    async fn hello(conn: &Connection) -> HelloOkPayload {
        let hello = HelloPayload {
            version: PROTOCOL_VERSION.into(),
        };
        conn.request(MsgType::Hello, &hello)
            .await
            .unwrap()
            .decode()
            .unwrap()
    }

    #[tokio::test]
    async fn hello_then_tunnel_open() {
        let (_agent, client) = agent_pair().await;
        let ok = hello(&client).await;
        assert_ne!(ok.session_id, 0);

        let req = TunnelOpenPayload {
            session_id: ok.session_id,
        };
        let first: TunnelOpenedPayload = client
            .request(MsgType::TunnelOpen, &req)
            .await
            .unwrap()
            .decode()
            .unwrap();
        let second: TunnelOpenedPayload = client
            .request(MsgType::TunnelOpen, &req)
            .await
            .unwrap()
            .decode()
            .unwrap();
        assert_ne!(first.tunnel_id, 0);
        assert_ne!(first.tunnel_id, second.tunnel_id);
        assert_eq!(first.session_id, ok.session_id);
    }

    #[tokio::test]
    async fn wrong_session_is_rejected() {
        let (agent, client) = agent_pair().await;
        let ok = hello(&client).await;

        let req = TunnelOpenPayload {
            session_id: ok.session_id.wrapping_add(1),
        };
        match client.request(MsgType::TunnelOpen, &req).await {
            Err(mole_core::MoleError::Remote { code, .. }) => {
                assert_eq!(code, error_code::BAD_SESSION)
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(agent.registry().is_empty());
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let (_agent, client) = agent_pair().await;
        let hello = HelloPayload {
            version: "mole-v0".into(),
        };
        let err = client.request(MsgType::Hello, &hello).await.unwrap_err();
        assert!(matches!(err, mole_core::MoleError::Remote { .. }));
    }

    #[tokio::test]
    async fn stray_response_is_ignored() {
        let (_agent, client) = agent_pair().await;
        let stray = ErrorPayload {
            code: 0,
            message: String::new(),
        };
        let env = Envelope::new(MsgType::TunnelOpened, 0, &stray).unwrap();
        client.writer().send_envelope(env).await.unwrap();

        let ok = hello(&client).await;
        assert_ne!(ok.session_id, 0);
    }

    #[tokio::test]
    async fn accept_loop_serves_tcp_clients() {
        let agent = Agent::new(AgentConfig {
            bind: "127.0.0.1".into(),
            port: 0,
            ..AgentConfig::default()
        });
        let listener = agent.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(agent.clone().run(listener));

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let client = Connection::start(stream, ConnectionConfig::default(), Dispatcher::new());
        let ok = tokio::time::timeout(Duration::from_secs(2), hello(&client))
            .await
            .unwrap();
        assert_eq!(ok.version, PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn accept_loop_outlives_dropped_operators() {
        let agent = Agent::new(AgentConfig {
            bind: "127.0.0.1".into(),
            port: 0,
            ..AgentConfig::default()
        });
        let listener = agent.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let runner = tokio::spawn(agent.clone().run(listener));

        for _ in 0..3 {
            drop(tokio::net::TcpStream::connect(addr).await.unwrap());
        }

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let client = Connection::start(stream, ConnectionConfig::default(), Dispatcher::new());
        let ok = tokio::time::timeout(Duration::from_secs(2), hello(&client))
            .await
            .unwrap();
        assert_ne!(ok.session_id, 0);
        assert!(!runner.is_finished());
    }

    #[tokio::test]
    async fn dial_and_shell_require_handshake() {
        let (agent, client) = agent_pair().await;

        let dial = TcpDialPayload {
            remote_host: "127.0.0.1".into(),
            remote_port: 9,
            tunnel_id: 7,
        };
        match client.request(MsgType::TcpDial, &dial).await {
            Err(mole_core::MoleError::Remote { code, .. }) => {
                assert_eq!(code, error_code::BAD_SESSION)
            }
            other => panic!("unexpected: {other:?}"),
        }

        let shell = ShellOpenPayload {
            tunnel_id: 8,
            path: Some("/bin/sh".into()),
            pty: false,
        };
        match client.request(MsgType::ShellOpen, &shell).await {
            Err(mole_core::MoleError::Remote { code, .. }) => {
                assert_eq!(code, error_code::BAD_SESSION)
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(agent.registry().is_empty());
    }
}
