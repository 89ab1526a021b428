//! Operator configuration at `~/.mole/config.toml`.
//!
//! Provides the default agent address and SOCKS listener settings.
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,
    #[serde(default)]
    pub socks: SocksConfig,
}

/// Connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultConfig {
    /// Agent address as `host:port` (empty = none).
    #[serde(default)]
    pub agent: String,

    /// Seconds allowed to reach the agent and finish the handshake.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            agent: String::new(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// `[socks]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SocksConfig {
    #[serde(default = "default_socks_bind")]
    pub bind: String,
    #[serde(default = "default_socks_port")]
    pub port: u16,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            bind: default_socks_bind(),
            port: default_socks_port(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_socks_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_socks_port() -> u16 {
    1080
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// The agent address: the CLI flag if given, else the config value.
    pub fn agent_addr(&self, flag: Option<&str>) -> Result<String> {
        match flag {
            Some(addr) => Ok(addr.to_string()),
            None if !self.default.agent.is_empty() => Ok(self.default.agent.clone()),
            None => anyhow::bail!("no agent address: pass --agent or set default.agent in the config"),
        }
    }
}

/// `~/.mole/config.toml`, or a relative fallback without a home directory.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".mole")
        .join("config.toml")
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let cfg = Config::default();
        assert!(cfg.default.agent.is_empty());
        assert_eq!(cfg.default.connect_timeout, 10);
        assert_eq!(cfg.socks.bind, "127.0.0.1");
        assert_eq!(cfg.socks.port, 1080);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[default]
agent = "10.0.0.2:7022"
connect_timeout = 3

[socks]
bind = "0.0.0.0"
port = 9050
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.default.agent, "10.0.0.2:7022");
        assert_eq!(cfg.default.connect_timeout, 3);
        assert_eq!(cfg.socks.bind, "0.0.0.0");
        assert_eq!(cfg.socks.port, 9050);
    }

    #[test]
    fn parse_partial_toml_config() {
        let cfg: Config = toml::from_str("[socks]\nport = 1081\n").unwrap();
        assert_eq!(cfg.socks.port, 1081);
        assert_eq!(cfg.socks.bind, "127.0.0.1"); // default
        assert!(cfg.default.agent.is_empty());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[default]\nagent = \"agent.lan:7022\"\n").unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.agent_addr(None).unwrap(), "agent.lan:7022");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/mole/config.toml")).unwrap();
        assert_eq!(cfg.socks.port, 1080);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[default\n").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn agent_flag_overrides_file() {
        let cfg: Config = toml::from_str("[default]\nagent = \"a:1\"\n").unwrap();
        assert_eq!(cfg.agent_addr(Some("b:2")).unwrap(), "b:2");
        assert!(Config::default().agent_addr(None).is_err());
    }

    #[test]
    fn tilde_expansion() {
        assert_eq!(expand_tilde("/etc/mole.toml"), PathBuf::from("/etc/mole.toml"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/x.toml"), home.join("x.toml"));
        }
    }
}
