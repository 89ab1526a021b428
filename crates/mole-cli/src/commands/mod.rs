//! CLI subcommand implementations.

pub mod portfwd;
pub mod shell;
pub mod socks;

use anyhow::{Context, Result};
use mole_client::{ClientConfig, MoleClient};
use std::time::Duration;
use tracing::info;

/// Connect and handshake with the agent at `addr`.
pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<MoleClient> {
    let config = ClientConfig {
        connect_timeout,
        ..ClientConfig::default()
    };
    let client = MoleClient::connect(addr, config)
        .await
        .with_context(|| format!("failed to connect to agent at {addr}"))?;
    info!(agent = %addr, session_id = client.session_id(), "connected to agent");
    Ok(client)
}
