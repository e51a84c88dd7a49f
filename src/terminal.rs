//! Scoped raw-mode handling for the host terminal.
//!
//! Raw mode is process-wide state. It is only ever entered through
//! [`RawModeGuard::acquire`] and left when the guard is released or dropped,
//! so every exit path (child exit, kill, host signal, panic unwind) restores it.

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, is_raw_mode_enabled};
use std::io::IsTerminal;

/// Holds the host terminal in raw, no-echo mode until released.
#[derive(Debug)]
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    /// Put the terminal into raw mode. Fails when stdin is not a terminal.
    pub fn acquire() -> std::io::Result<RawModeGuard> {
        if !std::io::stdin().is_terminal() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "stdin is not a terminal",
            ));
        }
        // Someone else already owns raw mode; don't undo their state on release.
        if is_raw_mode_enabled()? {
            return Ok(RawModeGuard { active: false });
        }
        enable_raw_mode()?;
        tracing::debug!("terminal raw mode enabled");
        Ok(RawModeGuard { active: true })
    }

    /// Restore the terminal. Safe to call more than once.
    pub fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        match disable_raw_mode() {
            Ok(()) => tracing::debug!("terminal raw mode restored"),
            Err(e) => tracing::warn!(error = %e, "failed to restore terminal mode"),
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Whether this host can run the interactive auto-exit race: a unix terminal
/// on stdin that raw mode can be applied to.
pub fn supports_auto_exit() -> bool {
    cfg!(unix) && std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_is_idempotent() {
        let mut guard = RawModeGuard { active: false };
        guard.release();
        guard.release();
        assert!(!guard.active);
    }
}
