//! Terminal handling for interactive exec sessions

use anyhow::{Context, Result};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, is_raw_mode_enabled};
use std::io::IsTerminal;

/// Raw mode for the lifetime of the guard; the previous mode is restored on
/// drop, including during unwinding.
pub struct RawModeGuard {
    restore: bool,
}

impl RawModeGuard {
    /// Enter raw mode when `enabled` and stdin is a terminal; otherwise the
    /// guard does nothing.
    pub fn acquire(enabled: bool) -> Result<Self> {
        if !enabled || !std::io::stdin().is_terminal() {
            return Ok(RawModeGuard { restore: false });
        }
        if is_raw_mode_enabled().unwrap_or(false) {
            return Ok(RawModeGuard { restore: false });
        }
        enable_raw_mode().context("failed to set raw mode")?;
        Ok(RawModeGuard { restore: true })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.restore {
            // Best-effort terminal restoration
            let _ = disable_raw_mode();
        }
    }
}

/// Decide whether the remote command gets a TTY.
///
/// `--no-tty` wins over `--it`; without either flag a TTY is used only when
/// both stdin and stdout are terminals.
pub fn select_tty(it: bool, no_tty: bool, stdin_tty: bool, stdout_tty: bool) -> bool {
    if no_tty {
        false
    } else if it {
        true
    } else {
        stdin_tty && stdout_tty
    }
}

/// [`select_tty`] against the real stdio handles
pub fn detect_tty(it: bool, no_tty: bool) -> bool {
    select_tty(
        it,
        no_tty,
        std::io::stdin().is_terminal(),
        std::io::stdout().is_terminal(),
    )
}
