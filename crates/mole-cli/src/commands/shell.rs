//! `mole shell` — interactive shell on the agent host.
//!
//! Local stdin is sent through the tunnel and shell output is written to
//! stdout. With a pty the local terminal is put in raw mode and `Ctrl+]`
//! disconnects.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use mole_client::MoleClient;
use mole_core::{Connection, Tunnel};

use crate::terminal::RawModeGuard;

/// Ctrl+] in raw mode.
const ESCAPE: u8 = 0x1d;

pub async fn run(client: MoleClient, path: Option<String>, pty: bool) -> Result<()> {
    let session = client
        .open_shell(path, pty)
        .await
        .context("failed to open shell")?;
    info!(tunnel_id = session.tunnel.id(), pid = ?session.pid, path = %session.path, "shell started");

    let _guard = if pty { RawModeGuard::enter_if_tty()? } else { None };

    let tunnel = session.tunnel.tunnel;
    let mut sink = session.tunnel.sink;
    let input = tokio::spawn(pump_stdin(client.connection().clone(), tunnel.clone(), pty));

    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = sink.recv().await {
        stdout.write_all(&chunk).await?;
        stdout.flush().await?;
    }
    input.abort();
    debug!(tunnel_id = tunnel.id(), "shell closed");
    Ok(())
}

async fn pump_stdin(conn: Arc<Connection>, tunnel: Arc<Tunnel>, raw: bool) {
    let id = tunnel.id();
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = tokio::select! {
            read = stdin.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
            _ = tunnel.closed() => return,
        };
        let data = &buf[..n];
        if raw && data.contains(&ESCAPE) {
            debug!(tunnel_id = id, "escape pressed");
            break;
        }
        if conn.send_data(id, data).await.is_err() {
            return;
        }
    }
    conn.close_tunnel(id).await;
}
