//! Pumps that bind a local byte stream to a tunnel.
//!
//! Two concurrent branches per bound resource:
//! - **resource → tunnel**: reads the local source and frames every chunk
//!   with the connection's [`FrameWriter`](crate::FrameWriter) until EOF, a
//!   read error, or the tunnel closing.
//! - **tunnel → resource**: drains the tunnel's sink queue into the local
//!   writer until the sink is dropped or a write fails.
//!
//! Whichever branch finishes first runs the close protocol.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::tunnel::{Tunnel, TunnelReceiver};

/// Read buffer used by [`pump_to_tunnel`].
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The local resource reached EOF.
    Eof,
    /// The tunnel was closed, or its sink drained after close.
    TunnelClosed,
    /// The local resource was closed underneath the pump.
    LocalClosed,
    /// An I/O error that is not a plain close.
    Failed,
}

/// I/O errors that only mean the local socket was already closed.
pub fn is_closed_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
    )
}

fn classify(tunnel_id: u64, e: &io::Error, direction: &'static str) -> PumpEnd {
    if is_closed_error(e) {
        debug!(tunnel_id, direction, error = %e, "local stream closed");
        PumpEnd::LocalClosed
    } else {
        warn!(tunnel_id, direction, error = %e, "relay I/O error");
        PumpEnd::Failed
    }
}

/// Copy `reader` into `tunnel` until EOF, an error, or the tunnel closing.
pub async fn pump_to_tunnel<R>(conn: &Connection, tunnel: &Tunnel, mut reader: R) -> PumpEnd
where
    R: AsyncRead + Unpin,
{
    let id = tunnel.id();
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            _ = tunnel.closed() => return PumpEnd::TunnelClosed,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!(tunnel_id = id, "local stream reached EOF");
                return PumpEnd::Eof;
            }
            Ok(n) => {
                if let Err(e) = conn.writer().send(tunnel, &buf[..n]).await {
                    debug!(tunnel_id = id, error = %e, "tunnel write stopped");
                    return PumpEnd::TunnelClosed;
                }
            }
            Err(e) => return classify(id, &e, "read"),
        }
    }
}

/// Drain `sink` into `writer`. Ends when the tunnel drops its sink.
pub async fn pump_from_tunnel<W>(tunnel_id: u64, mut sink: TunnelReceiver, mut writer: W) -> PumpEnd
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = sink.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            return classify(tunnel_id, &e, "write");
        }
        if let Err(e) = writer.flush().await {
            return classify(tunnel_id, &e, "write");
        }
    }
    let _ = writer.shutdown().await;
    PumpEnd::TunnelClosed
}

/// Join handles for both branches of a bound stream.
#[derive(Debug)]
pub struct RelayHandle {
    pub to_tunnel: JoinHandle<PumpEnd>,
    pub from_tunnel: JoinHandle<PumpEnd>,
}

impl RelayHandle {
    /// Wait for both branches to finish.
    pub async fn join(self) -> (Option<PumpEnd>, Option<PumpEnd>) {
        let to = self.to_tunnel.await.ok();
        let from = self.from_tunnel.await.ok();
        (to, from)
    }
}

/// Relay `stream` over `tunnel` in two spawned tasks. Each task closes the
/// tunnel when it ends; the close protocol makes the second call a no-op.
pub fn bind_stream<S>(
    conn: Arc<Connection>,
    tunnel: Arc<Tunnel>,
    sink: TunnelReceiver,
    stream: S,
) -> RelayHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let id = tunnel.id();

    let to_tunnel = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let end = pump_to_tunnel(&conn, &tunnel, reader).await;
            conn.close_tunnel(id).await;
            end
        })
    };
    let from_tunnel = tokio::spawn(async move {
        let end = pump_from_tunnel(id, sink, writer).await;
        conn.close_tunnel(id).await;
        end
    });

    RelayHandle {
        to_tunnel,
        from_tunnel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::dispatch::Dispatcher;
    use crate::messages::{Envelope, MsgType, TunnelDataPayload};
    use std::time::Duration;

    #[test]
    fn closed_error_kinds() {
        assert!(is_closed_error(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_closed_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_closed_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn local_eof_sends_data_then_close() {
        let (conn, mut outbound) = Connection::new(ConnectionConfig::default());
        let (tunnel, sink) = conn.register_tunnel(1).unwrap();
        let (mut local, resource) = tokio::io::duplex(1024);

        let handle = bind_stream(conn.clone(), tunnel, sink, resource);
        local.write_all(b"payload").await.unwrap();
        local.shutdown().await.unwrap();

        let first: TunnelDataPayload = outbound.recv().await.unwrap().decode().unwrap();
        assert_eq!(first.data, b"payload");
        assert_eq!(first.sequence, 0);
        let close: TunnelDataPayload = outbound.recv().await.unwrap().decode().unwrap();
        assert!(close.closed);
        assert_eq!(close.sequence, 1);

        let (to, _from) = tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();
        assert_eq!(to, Some(PumpEnd::Eof));
        assert!(conn.registry().is_empty());
    }

    #[tokio::test]
    async fn remote_close_stops_both_pumps_without_frame() {
        let (conn, mut outbound) = Connection::new(ConnectionConfig::default());
        let dispatcher = Dispatcher::new();
        let (tunnel, sink) = conn.register_tunnel(2).unwrap();
        let (mut local, resource) = tokio::io::duplex(1024);
        let handle = bind_stream(conn.clone(), tunnel, sink, resource);

        let data = TunnelDataPayload {
            tunnel_id: 2,
            sequence: 0,
            data: b"inbound".to_vec(),
            closed: false,
        };
        dispatcher.dispatch(&conn, Envelope::new(MsgType::TunnelData, 0, &data).unwrap());
        let close = TunnelDataPayload {
            tunnel_id: 2,
            sequence: 1,
            data: Vec::new(),
            closed: true,
        };
        dispatcher.dispatch(&conn, Envelope::new(MsgType::TunnelData, 0, &close).unwrap());

        let mut received = Vec::new();
        local.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"inbound");

        let (to, from) = tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();
        assert_eq!(to, Some(PumpEnd::TunnelClosed));
        assert_eq!(from, Some(PumpEnd::TunnelClosed));
        assert!(outbound.try_recv().is_err());
    }
}
