//! Raw terminal mode for interactive shells.

use anyhow::{Context, Result};
use crossterm::terminal;
use crossterm::tty::IsTty;

/// RAII guard that restores the terminal to cooked mode on drop.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    /// Enter raw terminal mode.
    pub fn enter() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self { _private: () })
    }

    /// Enter raw mode only when stdin is a terminal.
    pub fn enter_if_tty() -> Result<Option<Self>> {
        if std::io::stdin().is_tty() {
            Self::enter().map(Some)
        } else {
            Ok(None)
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}
