//! mole-client: operator-side library for mole.
//!
//! Connects to a mole agent over TCP, performs the handshake, and binds local
//! resources to tunnels: SOCKS5 clients, forwarded TCP ports and remote
//! shells.
//!
//! # Quick Start
//!
//! ```no_run
//! use mole_client::{ClientConfig, MoleClient, SocksServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = MoleClient::connect("10.0.0.2:7022", ClientConfig::default()).await?;
//! let socks = SocksServer::bind("127.0.0.1:1080").await?;
//! socks.run(client).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod portfwd;
pub mod socks;

// Re-export primary public types.
pub use client::{ClientConfig, MoleClient, OpenTunnel, ShellSession, TcpOpen};
pub use portfwd::{parse_host_port, PortForwarder};
pub use socks::{SocksError, SocksServer, SocksTarget};

// Re-export mole-core error types for convenience.
pub use mole_core::{MoleError, MoleResult};
