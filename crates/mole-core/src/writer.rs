//! Outbound framing for tunnel bytes.
//!
//! Every outbound chunk claims the tunnel's next write sequence and is pushed
//! as a `TunnelData` envelope onto the connection's bounded outbound queue.
//! The queue has a single consumer (the connection writer task), so frames
//! from different tunnels never interleave on the wire.

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{MoleError, MoleResult};
use crate::messages::{Envelope, MsgType, TunnelDataPayload};
use crate::tunnel::Tunnel;

#[derive(Debug, Clone)]
pub struct FrameWriter {
    tx: mpsc::Sender<Envelope>,
}

impl FrameWriter {
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    /// Frame `data` with the tunnel's next write sequence and enqueue it.
    ///
    /// Returns the sequence used. Empty input consumes no sequence and sends
    /// nothing. Waits while the outbound queue is full.
    pub async fn send(&self, tunnel: &Tunnel, data: &[u8]) -> MoleResult<u64> {
        if !tunnel.is_open() {
            return Err(MoleError::TunnelClosed(tunnel.id()));
        }
        if data.is_empty() {
            return Ok(tunnel.write_sequence());
        }

        let sequence = tunnel.next_write_sequence();
        let payload = TunnelDataPayload {
            tunnel_id: tunnel.id(),
            sequence,
            data: data.to_vec(),
            closed: false,
        };
        self.send_envelope(Envelope::new(MsgType::TunnelData, 0, &payload)?)
            .await?;
        trace!(tunnel_id = tunnel.id(), sequence, len = data.len(), "tunnel data queued");
        Ok(sequence)
    }

    /// Enqueue the tunnel's close frame. It takes a sequence slot so the peer
    /// applies it only after every earlier chunk.
    pub async fn send_close(&self, tunnel: &Tunnel) -> MoleResult<u64> {
        let sequence = tunnel.next_write_sequence();
        let payload = TunnelDataPayload {
            tunnel_id: tunnel.id(),
            sequence,
            data: Vec::new(),
            closed: true,
        };
        self.send_envelope(Envelope::new(MsgType::TunnelData, 0, &payload)?)
            .await?;
        Ok(sequence)
    }

    /// Enqueue an arbitrary envelope.
    pub async fn send_envelope(&self, envelope: Envelope) -> MoleResult<()> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| MoleError::ConnectionClosed)
    }
}
