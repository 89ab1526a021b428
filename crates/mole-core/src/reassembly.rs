//! Sequenced reassembly of tunnel chunks.
//!
//! Frames for one tunnel may arrive in any order. `Reassembly` caches them by
//! sequence number and releases the contiguous run that starts at the next
//! expected sequence. A missing sequence stalls delivery for the tunnel until
//! it arrives; there is no timeout. An optional chunk limit turns a growing
//! backlog into [`MoleError::ReassemblyOverflow`].

use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::trace;

use crate::error::{MoleError, MoleResult};

/// One cached unit of tunnel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Bytes),
    /// Close signal occupying its own sequence slot.
    Close,
}

/// Result of a single [`Reassembly::accept`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drain {
    /// Payloads now deliverable, in sequence order.
    pub data: Vec<Bytes>,
    /// A close chunk was reached; nothing after it will be delivered.
    pub closed: bool,
}

/// Per-tunnel reorder cache.
#[derive(Debug)]
pub struct Reassembly {
    tunnel_id: u64,
    read_sequence: u64,
    pending: BTreeMap<u64, Chunk>,
    limit: Option<usize>,
    finished: bool,
}

impl Reassembly {
    pub fn new(tunnel_id: u64, limit: Option<usize>) -> Self {
        Self {
            tunnel_id,
            read_sequence: 0,
            pending: BTreeMap::new(),
            limit,
            finished: false,
        }
    }

    /// Store `chunk` under `sequence`, then drain every contiguous chunk
    /// starting at the next expected sequence.
    ///
    /// Sequences already delivered or already cached are dropped as duplicates.
    pub fn accept(&mut self, sequence: u64, chunk: Chunk) -> MoleResult<Drain> {
        let mut drain = Drain::default();
        if self.finished {
            return Ok(drain);
        }

        if sequence < self.read_sequence || self.pending.contains_key(&sequence) {
            trace!(tunnel_id = self.tunnel_id, sequence, "duplicate chunk dropped");
            return Ok(drain);
        }
        self.pending.insert(sequence, chunk);

        while let Some(chunk) = self.pending.remove(&self.read_sequence) {
            self.read_sequence += 1;
            match chunk {
                Chunk::Data(bytes) => drain.data.push(bytes),
                Chunk::Close => {
                    drain.closed = true;
                    self.finished = true;
                    self.pending.clear();
                    break;
                }
            }
        }

        if let Some(limit) = self.limit {
            if self.pending.len() > limit {
                return Err(MoleError::ReassemblyOverflow {
                    tunnel_id: self.tunnel_id,
                    expected: self.read_sequence,
                    pending: self.pending.len(),
                });
            }
        }

        Ok(drain)
    }

    /// Next sequence number expected from the peer.
    pub fn read_sequence(&self) -> u64 {
        self.read_sequence
    }

    /// Number of chunks waiting behind a gap.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Discard every cached chunk.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.finished = true;
    }
}
