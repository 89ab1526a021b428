//! Inbound message routing.
//!
//! A [`Dispatcher`] is an immutable table from [`MsgType`] to handler, built
//! once per connection before its reader task starts. Responses never reach
//! the table: they complete the request waiting on their id. Handlers run on
//! the reader task and must not block; anything that does I/O spawns.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::messages::{Envelope, MsgType, TunnelClosePayload, TunnelDataPayload};

pub type Handler = Arc<dyn Fn(&Arc<Connection>, Envelope) + Send + Sync>;

#[derive(Clone)]
pub struct Dispatcher {
    handlers: HashMap<MsgType, Handler>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort_by_key(|t| u8::from(**t));
        f.debug_struct("Dispatcher").field("handles", &types).finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// A table with the tunnel handlers every peer needs: `TunnelData` into
    /// reassembly and `TunnelClose` into the remote-close path.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
        .on(MsgType::TunnelData, |conn, env| {
            match env.decode::<TunnelDataPayload>() {
                Ok(frame) => conn.on_tunnel_data(frame),
                Err(e) => warn!(error = %e, "malformed tunnel data dropped"),
            }
        })
        .on(MsgType::TunnelClose, |conn, env| {
            match env.decode::<TunnelClosePayload>() {
                Ok(msg) => {
                    conn.remote_close(msg.tunnel_id);
                }
                Err(e) => warn!(error = %e, "malformed tunnel close dropped"),
            }
        })
    }

    /// Register `handler` for `msg_type`, replacing any previous one.
    pub fn on<F>(mut self, msg_type: MsgType, handler: F) -> Self
    where
        F: Fn(&Arc<Connection>, Envelope) + Send + Sync + 'static,
    {
        self.handlers.insert(msg_type, Arc::new(handler));
        self
    }

    pub fn handles(&self, msg_type: MsgType) -> bool {
        self.handlers.contains_key(&msg_type)
    }

    /// Route one envelope.
    pub fn dispatch(&self, conn: &Arc<Connection>, envelope: Envelope) {
        if envelope.msg_type.is_response() {
            conn.complete_request(envelope);
            return;
        }
        match self.handlers.get(&envelope.msg_type) {
            Some(handler) => handler(conn, envelope),
            None => {
                debug!(id = envelope.id, msg_type = ?envelope.msg_type, "no handler");
                let reason = format!("unhandled message type {:?}", envelope.msg_type);
                conn.reject_unhandled(envelope.id, reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::messages::{error_code, ErrorPayload, TcpDialPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn dial() -> TcpDialPayload {
        TcpDialPayload {
            remote_host: "example.com".into(),
            remote_port: 80,
            tunnel_id: 1,
        }
    }

    #[tokio::test]
    async fn registered_handler_runs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let dispatcher = Dispatcher::new().on(MsgType::TcpDial, move |_, env| {
            assert_eq!(env.decode::<TcpDialPayload>().unwrap().remote_port, 80);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (conn, _rx) = Connection::new(ConnectionConfig::default());

        dispatcher.dispatch(&conn, Envelope::new(MsgType::TcpDial, 3, &dial()).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(dispatcher.handles(MsgType::TunnelData));
    }

    #[tokio::test]
    async fn unhandled_request_gets_error_reply() {
        let dispatcher = Dispatcher::new();
        let (conn, mut rx) = Connection::new(ConnectionConfig::default());

        dispatcher.dispatch(&conn, Envelope::new(MsgType::TcpDial, 9, &dial()).unwrap());
        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.msg_type, MsgType::Error);
        assert_eq!(reply.id, 9);
        assert_eq!(
            reply.decode::<ErrorPayload>().unwrap().code,
            error_code::UNKNOWN_TYPE
        );
    }

    #[tokio::test]
    async fn unhandled_notification_is_dropped() {
        let dispatcher = Dispatcher::new();
        let (conn, mut rx) = Connection::new(ConnectionConfig::default());

        dispatcher.dispatch(&conn, Envelope::new(MsgType::TcpDial, 0, &dial()).unwrap());
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_tunnel_data_is_ignored() {
        let dispatcher = Dispatcher::new();
        let (conn, mut rx) = Connection::new(ConnectionConfig::default());
        let (tunnel, _sink) = conn.register_tunnel(1).unwrap();

        dispatcher.dispatch(&conn, Envelope::new(MsgType::TunnelData, 0, &dial()).unwrap());
        assert!(tunnel.is_open());
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
