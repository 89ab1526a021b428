//! mole — operator CLI.
//!
//! Connects to a mole agent and exposes its network through a local SOCKS5
//! proxy, forwarded TCP ports, or an interactive shell.

mod commands;
mod config;
mod terminal;

use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// mole — tunnel client
#[derive(Parser)]
#[command(name = "mole", version, about = "Tunnel TCP and shells through a mole agent")]
struct Cli {
    /// Agent address (host:port)
    #[arg(short, long, global = true)]
    agent: Option<String>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a local SOCKS5 proxy through the agent
    Socks {
        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,
        /// Listen address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Forward a local port to HOST:PORT as seen from the agent
    Portfwd {
        /// Local listen address
        #[arg(long)]
        local: String,
        /// Remote target
        #[arg(long)]
        remote: String,
    },

    /// Open a shell on the agent host
    Shell {
        /// Shell executable on the agent
        #[arg(long)]
        path: Option<String>,
        /// Use plain pipes instead of a pseudo-terminal
        #[arg(long)]
        no_pty: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "mole=debug,mole_cli=debug,mole_client=debug,mole_core=debug"
    } else {
        "mole=warn,mole_cli=warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("mole: {e:#}");
            1
        }
    };
    // A blocked stdin read would otherwise hold the runtime open.
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .as_deref()
        .map(config::expand_tilde)
        .unwrap_or_else(config::default_path);
    let cfg = config::Config::load(&config_path)?;

    let agent = cfg.agent_addr(cli.agent.as_deref())?;
    let client = commands::connect(&agent, Duration::from_secs(cfg.default.connect_timeout)).await?;

    match cli.command {
        Command::Socks { port, bind } => {
            let bind = bind.unwrap_or(cfg.socks.bind);
            let port = port.unwrap_or(cfg.socks.port);
            commands::socks::run(client, &bind, port).await
        }
        Command::Portfwd { local, remote } => commands::portfwd::run(client, &local, &remote).await,
        Command::Shell { path, no_pty } => commands::shell::run(client, path, !no_pty).await,
    }
}
