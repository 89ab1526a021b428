//! mole-agent: the remote end of a mole connection.
//!
//! Accepts operator connections, allocates tunnels and binds them to outbound
//! TCP connections or spawned shells.

pub mod config;
pub mod resolver;
pub mod server;
pub mod shell;
pub mod tcp;

pub use config::{AgentConfig, Overrides};
pub use server::Agent;
