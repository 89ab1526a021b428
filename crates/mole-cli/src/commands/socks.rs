//! `mole socks` — run a local SOCKS5 proxy whose connections exit at the agent.

use anyhow::{Context, Result};
use mole_client::{MoleClient, SocksServer};
use tracing::info;

pub async fn run(client: MoleClient, bind: &str, port: u16) -> Result<()> {
    let addr = if bind.contains(':') {
        format!("[{bind}]:{port}")
    } else {
        format!("{bind}:{port}")
    };
    let server = SocksServer::bind(&addr)
        .await
        .with_context(|| format!("failed to bind SOCKS5 listener on {addr}"))?;
    eprintln!("SOCKS5 proxy on {}", server.local_addr()?);

    tokio::select! {
        result = server.run(client) => result.context("SOCKS5 server failed")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    Ok(())
}
