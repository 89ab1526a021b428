//! mole-agent: accepts operator connections and relays tunnels.

use anyhow::Context;
use clap::Parser;
use mole_agent::{Agent, AgentConfig, Overrides};
use std::path::PathBuf;
use tracing::{error, info};

/// mole-agent — tunnel relay agent
#[derive(Parser, Debug)]
#[command(name = "mole-agent", version, about = "Tunnel relay agent")]
struct Cli {
    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.mole/agent.toml")]
    config: String,

    /// Default shell for ShellOpen requests without a path
    #[arg(long)]
    shell: Option<String>,

    /// Seconds allowed to resolve and connect a dial target
    #[arg(long)]
    dial_timeout: Option<u64>,

    /// Out-of-order chunks a tunnel may cache before it is closed (0 = unbounded)
    #[arg(long)]
    max_pending_chunks: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting mole-agent");

    let overrides = Overrides {
        bind: cli.bind,
        port: cli.port,
        shell: cli.shell,
        dial_timeout: cli.dial_timeout,
        max_pending_chunks: cli.max_pending_chunks,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = AgentConfig::load(Some(&config_path), overrides).context("failed to load config")?;

    let agent = Agent::new(config);
    let listener = agent.bind().await.context("failed to bind listener")?;

    tokio::select! {
        result = agent.run(listener) => {
            if let Err(e) = result {
                error!(error = %e, "agent error");
                return Err(e.into());
            }
        }
        signal = shutdown_signal() => {
            signal?;
            info!("received shutdown signal");
        }
    }

    info!("mole-agent stopped");
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }
    Ok(())
}
