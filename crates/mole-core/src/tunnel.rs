//! A logical bidirectional byte stream multiplexed over one connection.
//!
//! Inbound bytes arrive through [`Tunnel::accept`], are reordered by the
//! tunnel's [`Reassembly`] cache and pushed into the local sink: an unbounded
//! queue drained by whichever task owns the local resource (socket, process
//! stdin). Outbound bytes are numbered with [`Tunnel::next_write_sequence`] by
//! the [`FrameWriter`](crate::writer::FrameWriter).
//!
//! A tunnel is either open or closed. [`Tunnel::begin_close`] performs the
//! transition exactly once: it drops the sink, discards the reorder cache and
//! fires the closed signal that relay tasks wait on.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};

use crate::error::MoleResult;
use crate::reassembly::{Chunk, Reassembly};

/// Receiving half of a tunnel's local sink.
pub type TunnelReceiver = mpsc::UnboundedReceiver<Bytes>;

/// Outcome of handing one chunk to a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Chunk cached or delivered; tunnel stays open.
    Open,
    /// The in-sequence close chunk was reached.
    CloseReached,
    /// The local sink is gone; the tunnel must be closed locally.
    SinkClosed,
}

struct Inbound {
    reassembly: Reassembly,
    sink: Option<mpsc::UnboundedSender<Bytes>>,
}

pub struct Tunnel {
    id: u64,
    write_sequence: AtomicU64,
    inbound: Mutex<Inbound>,
    closing: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("write_sequence", &self.write_sequence())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    /// Create an open tunnel and the receiver for its local sink.
    pub fn new(id: u64) -> (Arc<Self>, TunnelReceiver) {
        Self::with_limit(id, None)
    }

    /// Like [`Tunnel::new`] with an upper bound on chunks cached behind a gap.
    pub fn with_limit(id: u64, max_pending_chunks: Option<usize>) -> (Arc<Self>, TunnelReceiver) {
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let tunnel = Arc::new(Self {
            id,
            write_sequence: AtomicU64::new(0),
            inbound: Mutex::new(Inbound {
                reassembly: Reassembly::new(id, max_pending_chunks),
                sink: Some(sink_tx),
            }),
            closing: AtomicBool::new(false),
            closed_tx,
        });
        (tunnel, sink_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.closing.load(Ordering::Acquire)
    }

    /// Next inbound sequence number this tunnel expects.
    pub fn read_sequence(&self) -> u64 {
        self.lock_inbound().reassembly.read_sequence()
    }

    /// Next outbound sequence number that will be assigned.
    pub fn write_sequence(&self) -> u64 {
        self.write_sequence.load(Ordering::Acquire)
    }

    /// Number of inbound chunks waiting behind a gap.
    pub fn pending_chunks(&self) -> usize {
        self.lock_inbound().reassembly.pending_len()
    }

    /// Claim the next outbound sequence number.
    pub(crate) fn next_write_sequence(&self) -> u64 {
        self.write_sequence.fetch_add(1, Ordering::AcqRel)
    }

    /// Cache `chunk` and push every deliverable payload into the local sink.
    ///
    /// Never blocks: the sink is unbounded and the lock is only held for the
    /// in-memory reorder step.
    pub fn accept(&self, sequence: u64, chunk: Chunk) -> MoleResult<Delivery> {
        let mut inbound = self.lock_inbound();
        let drain = inbound.reassembly.accept(sequence, chunk)?;

        let Some(sink) = inbound.sink.as_ref() else {
            return Ok(Delivery::SinkClosed);
        };
        for bytes in drain.data {
            if sink.send(bytes).is_err() {
                return Ok(Delivery::SinkClosed);
            }
        }

        if drain.closed {
            Ok(Delivery::CloseReached)
        } else {
            Ok(Delivery::Open)
        }
    }

    /// Transition OPEN → CLOSED. Returns `true` for the single caller that
    /// performed the transition.
    pub fn begin_close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        {
            let mut inbound = self.lock_inbound();
            inbound.sink = None;
            inbound.reassembly.clear();
        }
        self.closed_tx.send_replace(true);
        true
    }

    /// Resolves once the tunnel is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        // The sender lives as long as `self`, so this only returns on close.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn lock_inbound(&self) -> std::sync::MutexGuard<'_, Inbound> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
