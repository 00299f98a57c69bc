//! Cooperative cancellation flags.
//!
//! The supervisor raises its flag on SIGINT/SIGTERM; each child raises its own
//! exit flag on SIGTERM only and ignores SIGINT, so a terminal interrupt is
//! handled once, by the supervisor, which then tears the children down in
//! order. Nothing here is pre-emptive: loops poll the flag between bounded
//! waits.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use nix::sys::signal::{self, SigHandler, Signal};
use tokio::signal::unix::{signal as unix_signal, SignalKind};

#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Raise `flag` on the first SIGINT or SIGTERM delivered to the supervisor.
pub fn install_supervisor_handlers(flag: ShutdownFlag) -> Result<()> {
    let mut sigterm =
        unix_signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint =
        unix_signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!(signal = "SIGINT", "shutdown requested by signal");
            }
            _ = sigterm.recv() => {
                tracing::info!(signal = "SIGTERM", "shutdown requested by signal");
            }
        }
        flag.request();
    });
    Ok(())
}

/// Children ignore SIGINT and treat SIGTERM as their exit flag.
pub fn install_child_handlers(flag: ShutdownFlag) -> Result<()> {
    // SAFETY: SIG_IGN installs no Rust code as a handler.
    unsafe { signal::signal(Signal::SIGINT, SigHandler::SigIgn) }
        .context("failed to ignore SIGINT")?;

    let mut sigterm =
        unix_signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        if sigterm.recv().await.is_some() {
            tracing::debug!("received SIGTERM, raising exit flag");
            flag.request();
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ShutdownFlag;

    #[test]
    fn clones_share_state() {
        let flag = ShutdownFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_requested());
        flag.request();
        assert!(observer.is_requested());
        flag.request();
        assert!(observer.is_requested());
    }
}
