//! Per-connection tunnel registry.
//!
//! Maps tunnel IDs to live [`Tunnel`]s. The dispatcher looks tunnels up on
//! every inbound data frame; the close protocol removes them. Removal is the
//! single ownership hand-off: exactly one caller gets the `Arc` back.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::{MoleError, MoleResult};
use crate::tunnel::Tunnel;

#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<u64, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel. An ID that is already present is rejected and the
    /// existing entry is left untouched.
    pub fn add(&self, tunnel: Arc<Tunnel>) -> MoleResult<()> {
        let id = tunnel.id();
        let mut tunnels = self.write();
        if tunnels.contains_key(&id) {
            return Err(MoleError::DuplicateTunnel(id));
        }
        tunnels.insert(id, tunnel);
        debug!(tunnel_id = id, "tunnel registered");
        Ok(())
    }

    /// Remove a tunnel. Returns `None` if it was already gone.
    pub fn remove(&self, id: u64) -> Option<Arc<Tunnel>> {
        let removed = self.write().remove(&id);
        if removed.is_some() {
            debug!(tunnel_id = id, "tunnel unregistered");
        }
        removed
    }

    pub fn get(&self, id: u64) -> Option<Arc<Tunnel>> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Remove and return every tunnel (connection teardown).
    pub fn drain(&self) -> Vec<Arc<Tunnel>> {
        self.write().drain().map(|(_, t)| t).collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<u64, Arc<Tunnel>>> {
        self.tunnels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u64, Arc<Tunnel>>> {
        self.tunnels.write().unwrap_or_else(PoisonError::into_inner)
    }
}
