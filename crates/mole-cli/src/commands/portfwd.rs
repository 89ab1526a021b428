//! `mole portfwd` — forward a local TCP port to a target reachable from the agent.

use anyhow::{Context, Result};
use mole_client::{MoleClient, PortForwarder};
use tracing::info;

pub async fn run(client: MoleClient, local: &str, remote: &str) -> Result<()> {
    let forwarder = PortForwarder::bind(local, remote)
        .await
        .with_context(|| format!("failed to forward {local} -> {remote}"))?;
    eprintln!("forwarding {} -> {remote}", forwarder.local_addr()?);

    tokio::select! {
        result = forwarder.run(client) => result.context("port forwarder failed")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    Ok(())
}
