//! Shell endpoint: handles `ShellOpen` by spawning a shell bound to a tunnel.
//!
//! Two process modes:
//! - **pipes**: `tokio::process` with stdin fed from the tunnel and both
//!   stdout and stderr framed back.
//! - **pty**: a pseudo-terminal from `portable-pty`; its master side is
//!   blocking, so reads and writes run on blocking threads.
//!
//! The tunnel closes when the shell's output ends. A tunnel closed from the
//! client side kills the shell.

use portable_pty::{native_pty_system, Child as PtyChild, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mole_core::messages::{error_code, ShellOpenPayload, ShellOpenedPayload};
use mole_core::relay::{pump_from_tunnel, pump_to_tunnel, PumpEnd};
use mole_core::{Connection, Envelope, MoleError, MoleResult, MsgType, Tunnel, TunnelReceiver};

const FALLBACK_SHELL: &str = "/bin/sh";

/// Pick the shell binary: request, then agent config, then `$SHELL`.
pub fn shell_path(requested: Option<&str>, configured: Option<&str>) -> String {
    requested
        .filter(|p| !p.is_empty())
        .or(configured.filter(|p| !p.is_empty()))
        .map(str::to_string)
        .or_else(|| std::env::var("SHELL").ok().filter(|p| !p.is_empty()))
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

/// A spawned pseudo-terminal shell.
pub struct PtyShell {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn PtyChild + Send + Sync>,
    /// Kept open for the lifetime of the shell.
    master: Box<dyn MasterPty + Send>,
}

impl PtyShell {
    pub fn spawn(path: &str) -> MoleResult<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| MoleError::Other(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(path);
        cmd.env("TERM", "xterm-256color");
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| MoleError::Other(format!("failed to spawn {path}: {e}")))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| MoleError::Other(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| MoleError::Other(format!("failed to take PTY writer: {e}")))?;

        Ok(Self {
            reader,
            writer,
            child,
            master: pair.master,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "PTY kill failed");
        }
    }
}

/// Spawn `path` with piped stdio.
pub fn spawn_pipes(path: &str) -> MoleResult<Child> {
    let child = Command::new(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}

enum Spawned {
    Pipes(Child),
    Pty(PtyShell),
}

impl Spawned {
    fn pid(&self) -> Option<u32> {
        match self {
            Spawned::Pipes(child) => child.id(),
            Spawned::Pty(pty) => pty.pid(),
        }
    }

    async fn kill(self) {
        match self {
            Spawned::Pipes(mut child) => {
                let _ = child.kill().await;
            }
            Spawned::Pty(mut pty) => pty.kill(),
        }
    }
}

/// Handle one `ShellOpen` request end to end. Runs in its own task.
pub async fn handle_open(conn: Arc<Connection>, request: Envelope, configured_shell: Option<String>) {
    let req: ShellOpenPayload = match request.decode() {
        Ok(req) => req,
        Err(e) => {
            reply_error(&conn, &request, error_code::MALFORMED, e.to_string()).await;
            return;
        }
    };
    let id = req.tunnel_id;
    if id == 0 {
        reply_error(&conn, &request, error_code::MALFORMED, "tunnel id 0").await;
        return;
    }
    if conn.registry().contains(id) {
        reply_error(&conn, &request, error_code::TUNNEL_IN_USE, format!("tunnel {id} in use")).await;
        return;
    }

    let path = shell_path(req.path.as_deref(), configured_shell.as_deref());
    let spawned = if req.pty {
        PtyShell::spawn(&path).map(Spawned::Pty)
    } else {
        spawn_pipes(&path).map(Spawned::Pipes)
    };
    let spawned = match spawned {
        Ok(spawned) => spawned,
        Err(e) => {
            warn!(tunnel_id = id, path = %path, error = %e, "shell spawn failed");
            reply_error(&conn, &request, error_code::SPAWN_FAILED, e.to_string()).await;
            return;
        }
    };

    let (tunnel, sink) = match conn.register_tunnel(id) {
        Ok(registered) => registered,
        Err(e) => {
            spawned.kill().await;
            reply_error(&conn, &request, error_code::TUNNEL_IN_USE, e.to_string()).await;
            return;
        }
    };

    let pid = spawned.pid();
    let opened = ShellOpenedPayload {
        tunnel_id: id,
        pid,
        path: path.clone(),
    };
    if let Err(e) = conn.respond(&request, MsgType::ShellOpened, &opened).await {
        debug!(tunnel_id = id, error = %e, "shell reply not sent");
        conn.discard_tunnel(id);
        spawned.kill().await;
        return;
    }
    info!(tunnel_id = id, path = %path, pid = ?pid, pty = req.pty, "shell started");

    match spawned {
        Spawned::Pipes(child) => run_pipes(conn, tunnel, sink, child).await,
        Spawned::Pty(pty) => run_pty(conn, tunnel, sink, pty).await,
    }
}

async fn reply_error(conn: &Connection, request: &Envelope, code: u32, message: impl Into<String>) {
    if let Err(e) = conn.respond_error(request.id, code, message).await {
        debug!(error = %e, "shell error reply not sent");
    }
}

async fn run_pipes(conn: Arc<Connection>, tunnel: Arc<Tunnel>, sink: TunnelReceiver, mut child: Child) {
    let id = tunnel.id();

    if let Some(stdin) = child.stdin.take() {
        tokio::spawn(async move {
            pump_from_tunnel(id, sink, stdin).await;
        });
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out = async {
        match stdout {
            Some(stdout) => pump_to_tunnel(&conn, &tunnel, stdout).await,
            None => PumpEnd::Eof,
        }
    };
    let err = async {
        match stderr {
            Some(stderr) => pump_to_tunnel(&conn, &tunnel, stderr).await,
            None => PumpEnd::Eof,
        }
    };
    let (out_end, err_end) = tokio::join!(out, err);
    debug!(tunnel_id = id, stdout = ?out_end, stderr = ?err_end, "shell output ended");

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => info!(tunnel_id = id, code = ?status.code(), "shell exited"),
            Err(e) => warn!(tunnel_id = id, error = %e, "shell wait failed"),
        },
        _ = tunnel.closed() => {
            let _ = child.kill().await;
            info!(tunnel_id = id, "shell killed");
        }
    }
    conn.close_tunnel(id).await;
}

async fn run_pty(conn: Arc<Connection>, tunnel: Arc<Tunnel>, sink: TunnelReceiver, pty: PtyShell) {
    let id = tunnel.id();
    let PtyShell {
        mut reader,
        mut writer,
        mut child,
        master,
    } = pty;
    let mut killer = child.clone_killer();

    // Tunnel → PTY input
    tokio::task::spawn_blocking(move || {
        let mut sink = sink;
        while let Some(bytes) = sink.blocking_recv() {
            if writer.write_all(&bytes).and_then(|_| writer.flush()).is_err() {
                break;
            }
        }
    });

    // PTY output → channel
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(32);
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let exit = tokio::task::spawn_blocking(move || child.wait());

    loop {
        tokio::select! {
            _ = tunnel.closed() => {
                if let Err(e) = killer.kill() {
                    debug!(tunnel_id = id, error = %e, "PTY kill failed");
                }
                info!(tunnel_id = id, "shell killed");
                break;
            }
            chunk = out_rx.recv() => match chunk {
                Some(chunk) => {
                    if let Err(e) = conn.writer().send(&tunnel, &chunk).await {
                        debug!(tunnel_id = id, error = %e, "PTY output stopped");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    conn.close_tunnel(id).await;
    drop(master);

    tokio::spawn(async move {
        if let Ok(Ok(status)) = exit.await {
            info!(tunnel_id = id, code = status.exit_code(), "shell exited");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use mole_core::messages::{ErrorPayload, TunnelDataPayload};
    use mole_core::ConnectionConfig;
    use std::time::Duration;

    #[test]
    fn shell_path_precedence() {
        assert_eq!(shell_path(Some("/bin/zsh"), Some("/bin/bash")), "/bin/zsh");
        assert_eq!(shell_path(None, Some("/bin/bash")), "/bin/bash");
        assert_eq!(shell_path(Some(""), Some("/bin/bash")), "/bin/bash");
        assert!(!shell_path(None, None).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipe_shell_runs_input_and_closes() {
        let (conn, mut rx) = Connection::new(ConnectionConfig::default());
        let payload = ShellOpenPayload {
            tunnel_id: 21,
            path: Some("/bin/sh".into()),
            pty: false,
        };
        let request = Envelope::new(MsgType::ShellOpen, 4, &payload).unwrap();
        let task = tokio::spawn(handle_open(conn.clone(), request, None));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.msg_type, MsgType::ShellOpened);
        assert_eq!(reply.id, 4);
        let opened: ShellOpenedPayload = reply.decode().unwrap();
        assert_eq!(opened.tunnel_id, 21);
        assert_eq!(opened.path, "/bin/sh");

        conn.on_tunnel_data(TunnelDataPayload {
            tunnel_id: 21,
            sequence: 0,
            data: b"echo hi\nexit\n".to_vec(),
            closed: false,
        });

        let mut output = Vec::new();
        let mut closed = false;
        while !closed {
            let env = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("shell output")
                .unwrap();
            let frame: TunnelDataPayload = env.decode().unwrap();
            assert_eq!(frame.tunnel_id, 21);
            output.extend(frame.data);
            closed = frame.closed;
        }
        assert_eq!(output, b"hi\n");
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(conn.registry().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pty_shell_runs_input_and_closes() {
        let (conn, mut rx) = Connection::new(ConnectionConfig::default());
        let payload = ShellOpenPayload {
            tunnel_id: 22,
            path: Some("/bin/sh".into()),
            pty: true,
        };
        let request = Envelope::new(MsgType::ShellOpen, 5, &payload).unwrap();
        let task = tokio::spawn(handle_open(conn.clone(), request, None));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.msg_type, MsgType::ShellOpened);
        let opened: ShellOpenedPayload = reply.decode().unwrap();
        assert!(opened.pid.is_some());

        conn.on_tunnel_data(TunnelDataPayload {
            tunnel_id: 22,
            sequence: 0,
            data: b"echo pty-$((40+2))\nexit\n".to_vec(),
            closed: false,
        });

        // The terminal echoes the typed line; only the shell prints the sum.
        let mut output = Vec::new();
        let mut closed = false;
        while !closed {
            let env = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("pty output")
                .unwrap();
            let frame: TunnelDataPayload = env.decode().unwrap();
            output.extend(frame.data);
            closed = frame.closed;
        }
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("pty-42"), "output: {text:?}");
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(conn.registry().is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_response() {
        let (conn, mut rx) = Connection::new(ConnectionConfig::default());
        let payload = ShellOpenPayload {
            tunnel_id: 3,
            path: Some("/nonexistent/shell".into()),
            pty: false,
        };
        let request = Envelope::new(MsgType::ShellOpen, 8, &payload).unwrap();
        handle_open(conn.clone(), request, None).await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.msg_type, MsgType::Error);
        assert_eq!(reply.decode::<ErrorPayload>().unwrap().code, error_code::SPAWN_FAILED);
        assert!(conn.registry().is_empty());
    }

    #[tokio::test]
    async fn tunnel_in_use_is_rejected() {
        let (conn, mut rx) = Connection::new(ConnectionConfig::default());
        let (_t, _sink) = conn.register_tunnel(5).unwrap();
        let payload = ShellOpenPayload {
            tunnel_id: 5,
            path: None,
            pty: false,
        };
        let request = Envelope::new(MsgType::ShellOpen, 1, &payload).unwrap();
        handle_open(conn.clone(), request, None).await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.decode::<ErrorPayload>().unwrap().code, error_code::TUNNEL_IN_USE);
    }
}
