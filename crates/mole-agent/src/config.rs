//! Agent configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use mole_core::{ConnectionConfig, MoleError, MoleResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentSection,
}

/// `[agent]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub shell: Option<String>,
    /// Seconds allowed for resolving and connecting a dial target.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    /// Chunks a tunnel may cache behind a missing sequence. 0 disables the bound.
    #[serde(default)]
    pub max_pending_chunks: usize,
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            shell: None,
            dial_timeout: default_dial_timeout(),
            max_pending_chunks: 0,
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7022
}
fn default_dial_timeout() -> u64 {
    10
}
fn default_outbound_capacity() -> usize {
    256
}

/// Values given on the command line. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub shell: Option<String>,
    pub dial_timeout: Option<u64>,
    pub max_pending_chunks: Option<usize>,
}

/// Resolved agent configuration (file loaded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind: String,
    pub port: u16,
    pub shell: Option<String>,
    pub dial_timeout: Duration,
    pub max_pending_chunks: Option<usize>,
    pub outbound_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from_section(AgentSection::default(), Overrides::default())
    }
}

impl AgentConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> MoleResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| MoleError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::from_section(file_config.agent, overrides))
    }

    fn from_section(section: AgentSection, overrides: Overrides) -> Self {
        let max_pending = overrides
            .max_pending_chunks
            .unwrap_or(section.max_pending_chunks);
        Self {
            bind: overrides.bind.unwrap_or(section.bind),
            port: overrides.port.unwrap_or(section.port),
            shell: overrides.shell.or(section.shell),
            dial_timeout: Duration::from_secs(overrides.dial_timeout.unwrap_or(section.dial_timeout)),
            max_pending_chunks: (max_pending > 0).then_some(max_pending),
            outbound_capacity: section.outbound_capacity.max(1),
        }
    }

    /// `bind:port` for the listener.
    pub fn listen_addr(&self) -> String {
        if self.bind.contains(':') {
            format!("[{}]:{}", self.bind, self.port)
        } else {
            format!("{}:{}", self.bind, self.port)
        }
    }

    /// Settings for every accepted connection.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            outbound_capacity: self.outbound_capacity,
            max_pending_chunks: self.max_pending_chunks,
            ..ConnectionConfig::default()
        }
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_without_file() {
        let cfg = AgentConfig::load(None, Overrides::default()).unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:7022");
        assert_eq!(cfg.dial_timeout, Duration::from_secs(10));
        assert_eq!(cfg.max_pending_chunks, None);
        assert!(cfg.shell.is_none());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = AgentConfig::load(
            Some(Path::new("/nonexistent/mole/agent.toml")),
            Overrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.port, 7022);
    }

    #[test]
    fn file_values_are_read() {
        let file = write_config(
            r#"
[agent]
bind = "127.0.0.1"
port = 9000
shell = "/bin/bash"
dial_timeout = 3
max_pending_chunks = 512
"#,
        );
        let cfg = AgentConfig::load(Some(file.path()), Overrides::default()).unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:9000");
        assert_eq!(cfg.shell.as_deref(), Some("/bin/bash"));
        assert_eq!(cfg.dial_timeout, Duration::from_secs(3));
        assert_eq!(cfg.max_pending_chunks, Some(512));
        assert_eq!(cfg.connection_config().max_pending_chunks, Some(512));
    }

    #[test]
    fn cli_overrides_file() {
        let file = write_config("[agent]\nport = 9000\nmax_pending_chunks = 10\n");
        let overrides = Overrides {
            port: Some(9100),
            shell: Some("/bin/zsh".into()),
            max_pending_chunks: Some(0),
            ..Overrides::default()
        };
        let cfg = AgentConfig::load(Some(file.path()), overrides).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(cfg.max_pending_chunks, None);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let file = write_config("[agent\nport = ");
        assert!(AgentConfig::load(Some(file.path()), Overrides::default()).is_err());
    }

    #[test]
    fn ipv6_bind_is_bracketed() {
        let cfg = AgentConfig {
            bind: "::".into(),
            ..AgentConfig::default()
        };
        assert_eq!(cfg.listen_addr(), "[::]:7022");
    }
}
