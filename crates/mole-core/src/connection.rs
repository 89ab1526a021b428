//! One control connection and the tunnels multiplexed over it.
//!
//! A `Connection` owns the tunnel registry, the outbound queue (through its
//! [`FrameWriter`]) and the table of in-flight requests. [`Connection::start`]
//! binds it to a byte stream with one reader task, which feeds every inbound
//! envelope to a [`Dispatcher`], and one writer task, which drains the
//! outbound queue onto the stream.
//!
//! Close protocol:
//! - [`Connection::close_tunnel`]: local close; sends exactly one close frame.
//! - [`Connection::remote_close`]: the peer closed; nothing is sent back.
//! - [`Connection::discard_tunnel`]: drop a tunnel the peer never bound.
//! - [`Connection::shutdown`]: connection teardown; every tunnel is closed
//!   without frames and every pending request fails.

use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::codec::{cbor_decode, read_frame, write_frame};
use crate::dispatch::Dispatcher;
use crate::error::{MoleError, MoleResult};
use crate::messages::{
    error_code, Envelope, ErrorPayload, MsgType, RawEnvelope, TunnelDataPayload,
};
use crate::reassembly::Chunk;
use crate::registry::TunnelRegistry;
use crate::tunnel::{Delivery, Tunnel, TunnelReceiver};
use crate::writer::FrameWriter;

/// Tuning knobs for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the shared outbound queue. Writers wait when it is full.
    pub outbound_capacity: usize,
    /// How long a request waits for its response.
    pub request_timeout: Duration,
    /// Per-tunnel bound on chunks cached behind a gap. `None` stalls forever.
    pub max_pending_chunks: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            request_timeout: Duration::from_secs(30),
            max_pending_chunks: None,
        }
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<Envelope>>;

pub struct Connection {
    config: ConnectionConfig,
    registry: TunnelRegistry,
    writer: FrameWriter,
    pending: Mutex<PendingMap>,
    next_request_id: AtomicU64,
    shut: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("tunnels", &self.registry.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection that is not yet bound to a stream. The returned
    /// receiver is the outbound queue.
    pub fn new(config: ConnectionConfig) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (closed_tx, _) = watch::channel(false);
        let conn = Arc::new(Self {
            config,
            registry: TunnelRegistry::new(),
            writer: FrameWriter::new(tx),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            shut: AtomicBool::new(false),
            closed_tx,
        });
        (conn, rx)
    }

    /// Bind a new connection to `stream` and start its reader and writer tasks.
    pub fn start<S>(stream: S, config: ConnectionConfig, dispatcher: Dispatcher) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (conn, outbound) = Self::new(config);
        let (reader, writer) = tokio::io::split(stream);

        tokio::spawn(write_loop(conn.clone(), writer, outbound));
        tokio::spawn(read_loop(conn.clone(), reader, dispatcher));
        conn
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub fn writer(&self) -> &FrameWriter {
        &self.writer
    }

    pub fn is_closed(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    // ── Tunnels ──────────────────────────────────────────────────────

    /// Create a tunnel with `id` and register it on this connection.
    pub fn register_tunnel(&self, id: u64) -> MoleResult<(Arc<Tunnel>, TunnelReceiver)> {
        if self.is_closed() {
            return Err(MoleError::ConnectionClosed);
        }
        let (tunnel, sink) = Tunnel::with_limit(id, self.config.max_pending_chunks);
        self.registry.add(tunnel.clone())?;
        Ok((tunnel, sink))
    }

    /// Frame `data` onto tunnel `id`.
    pub async fn send_data(&self, id: u64, data: &[u8]) -> MoleResult<u64> {
        let tunnel = self.registry.get(id).ok_or(MoleError::TunnelNotFound(id))?;
        self.writer.send(&tunnel, data).await
    }

    /// Close tunnel `id` from this side and tell the peer.
    ///
    /// Returns `true` for the single caller that performed the close. Closing
    /// an absent or already closed tunnel is a no-op.
    pub async fn close_tunnel(&self, id: u64) -> bool {
        let Some(tunnel) = self.registry.remove(id) else {
            return false;
        };
        if !tunnel.begin_close() {
            return false;
        }
        if let Err(e) = self.writer.send_close(&tunnel).await {
            debug!(tunnel_id = id, error = %e, "close frame not sent");
        }
        info!(tunnel_id = id, "tunnel closed");
        true
    }

    /// Close tunnel `id` because the peer closed it. No frame is sent back.
    pub fn remote_close(&self, id: u64) -> bool {
        let closed = self.close_silently(id);
        if closed {
            info!(tunnel_id = id, "tunnel closed by peer");
        }
        closed
    }

    /// Drop tunnel `id` locally without notifying the peer.
    pub fn discard_tunnel(&self, id: u64) -> bool {
        let closed = self.close_silently(id);
        if closed {
            debug!(tunnel_id = id, "tunnel discarded");
        }
        closed
    }

    fn close_silently(&self, id: u64) -> bool {
        match self.registry.remove(id) {
            Some(tunnel) => tunnel.begin_close(),
            None => false,
        }
    }

    /// Route one inbound data frame into its tunnel.
    ///
    /// Never blocks. Data for an unknown tunnel is dropped.
    pub fn on_tunnel_data(self: &Arc<Self>, frame: TunnelDataPayload) {
        let id = frame.tunnel_id;
        let Some(tunnel) = self.registry.get(id) else {
            debug!(tunnel_id = id, sequence = frame.sequence, "data for unknown tunnel dropped");
            return;
        };

        let chunk = if frame.closed {
            Chunk::Close
        } else {
            Chunk::Data(Bytes::from(frame.data))
        };
        trace!(tunnel_id = id, sequence = frame.sequence, "tunnel data received");

        match tunnel.accept(frame.sequence, chunk) {
            Ok(Delivery::Open) => {}
            Ok(Delivery::CloseReached) => {
                self.remote_close(id);
            }
            Ok(Delivery::SinkClosed) => {
                debug!(tunnel_id = id, "tunnel sink gone");
                self.spawn_close(id);
            }
            Err(e) => {
                warn!(tunnel_id = id, error = %e, "closing tunnel");
                self.spawn_close(id);
            }
        }
    }

    fn spawn_close(self: &Arc<Self>, id: u64) {
        let conn = self.clone();
        tokio::spawn(async move {
            conn.close_tunnel(id).await;
        });
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Send a request and wait for the response with the same id.
    ///
    /// An `Error` response becomes [`MoleError::Remote`]; any other type than
    /// the one `msg_type` expects becomes [`MoleError::UnexpectedResponse`].
    pub async fn request<T: Serialize>(&self, msg_type: MsgType, payload: &T) -> MoleResult<Envelope> {
        let expected = msg_type
            .response()
            .ok_or_else(|| MoleError::Protocol(format!("{msg_type:?} is not a request")))?;

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(msg_type, id, payload)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            if self.is_closed() {
                return Err(MoleError::ConnectionClosed);
            }
            pending.insert(id, tx);
        }

        if let Err(e) = self.writer.send_envelope(envelope).await {
            self.lock_pending().remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(env)) => env,
            Ok(Err(_)) => return Err(MoleError::ConnectionClosed),
            Err(_) => {
                self.lock_pending().remove(&id);
                return Err(MoleError::Timeout);
            }
        };

        if response.msg_type == MsgType::Error {
            let err: ErrorPayload = response.decode()?;
            return Err(MoleError::Remote {
                code: err.code,
                message: err.message,
            });
        }
        if response.msg_type != expected {
            return Err(MoleError::UnexpectedResponse(format!(
                "expected {expected:?}, got {:?}",
                response.msg_type
            )));
        }
        Ok(response)
    }

    /// Answer `request` with a typed response.
    pub async fn respond<T: Serialize>(
        &self,
        request: &Envelope,
        msg_type: MsgType,
        payload: &T,
    ) -> MoleResult<()> {
        self.writer
            .send_envelope(Envelope::new(msg_type, request.id, payload)?)
            .await
    }

    /// Answer request `id` with an `Error` envelope.
    pub async fn respond_error(&self, id: u64, code: u32, message: impl Into<String>) -> MoleResult<()> {
        let payload = ErrorPayload {
            code,
            message: message.into(),
        };
        self.writer
            .send_envelope(Envelope::new(MsgType::Error, id, &payload)?)
            .await
    }

    /// Hand a response to the request waiting for it.
    pub(crate) fn complete_request(&self, envelope: Envelope) {
        let waiter = self.lock_pending().remove(&envelope.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(envelope);
            }
            None => debug!(
                id = envelope.id,
                msg_type = ?envelope.msg_type,
                "response for unknown request dropped"
            ),
        }
    }

    /// Reply `UNKNOWN_TYPE` to a request nobody handles.
    pub(crate) fn reject_unhandled(self: &Arc<Self>, id: u64, reason: String) {
        if id == 0 {
            return;
        }
        let conn = self.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.respond_error(id, error_code::UNKNOWN_TYPE, reason).await {
                debug!(id, error = %e, "error reply not sent");
            }
        });
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Tear the connection down: close every tunnel without sending frames,
    /// fail every pending request and stop the reader and writer tasks.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }

        let tunnels = self.registry.drain();
        let count = tunnels.len();
        for tunnel in tunnels {
            tunnel.begin_close();
        }

        let pending: Vec<_> = self.lock_pending().drain().collect();
        drop(pending);

        self.closed_tx.send_replace(true);
        info!(tunnels = count, "connection closed");
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn write_loop<W>(conn: Arc<Connection>, mut writer: W, mut outbound: mpsc::Receiver<Envelope>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(envelope) = next else { break };
                let result = match write_frame(&mut writer, &envelope).await {
                    Ok(()) => writer.flush().await.map_err(MoleError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(error = %e, "connection write failed");
                    break;
                }
            }
            _ = conn.closed() => break,
        }
    }
    let _ = writer.shutdown().await;
    conn.shutdown();
}

async fn read_loop<R>(conn: Arc<Connection>, mut reader: R, dispatcher: Dispatcher)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = conn.closed() => break,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(MoleError::ConnectionClosed) => {
                debug!("peer closed connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "connection read failed");
                break;
            }
        };

        let raw: RawEnvelope = match cbor_decode(&frame) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "undecodable envelope dropped");
                continue;
            }
        };
        match MsgType::try_from(raw.msg_type) {
            Ok(msg_type) => dispatcher.dispatch(
                &conn,
                Envelope {
                    id: raw.id,
                    msg_type,
                    data: raw.data,
                },
            ),
            Err(reason) => {
                debug!(id = raw.id, %reason, "unknown message type");
                conn.reject_unhandled(raw.id, reason);
            }
        }
    }
    conn.shutdown();
}
