//! Cross-process write gate for the shared IRC socket.
//!
//! The gate is an advisory `flock(2)` on a per-run lock file. Every
//! acquisition opens its own file description, so two holders exclude each
//! other whether they live in different processes or in different tasks of
//! the same process. The supervisor owns the file ([`GateFile`]); children only
//! know its path.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    time::Duration,
};

use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};
use tempfile::NamedTempFile;

use crate::shutdown::ShutdownFlag;

const ACQUIRE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("failed to create gate lock file: {0}")]
    Create(#[source] std::io::Error),
    #[error("failed to open gate lock file {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("flock on gate lock file failed: {0}")]
    Lock(#[source] Errno),
}

/// Owner of the lock file. Dropping it (or calling [`GateFile::remove`])
/// deletes the file, after which gate acquisitions fail to open it.
#[derive(Debug)]
pub struct GateFile {
    file: NamedTempFile,
}

impl GateFile {
    pub fn create() -> Result<Self, GateError> {
        let file = tempfile::Builder::new()
            .prefix("irc-relay-gate-")
            .suffix(".lock")
            .tempfile()
            .map_err(GateError::Create)?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn gate(&self) -> SharedGate {
        SharedGate {
            path: self.file.path().to_path_buf(),
        }
    }

    pub fn remove(self) {
        let path = self.file.path().to_path_buf();
        if let Err(error) = self.file.close() {
            tracing::warn!(path = %path.display(), error = %error, "failed to remove gate lock file");
        }
    }
}

/// Handle to the gate, cheap to clone and hand to children by path.
#[derive(Debug, Clone)]
pub struct SharedGate {
    path: PathBuf,
}

/// Holding this value is holding the gate; dropping it releases.
#[derive(Debug)]
pub struct GateGuard {
    _lock: Flock<File>,
}

impl SharedGate {
    /// Attach to a gate created by another process.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, GateError> {
        let gate = Self { path: path.into() };
        gate.open_file()?;
        Ok(gate)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until this caller holds the gate.
    ///
    /// An uncontended gate is always taken, even after cancellation, so that
    /// shutdown can still say goodbye on the wire. While contended, the wait
    /// gives up with `Ok(None)` once `cancel` is raised.
    pub async fn acquire(&self, cancel: &ShutdownFlag) -> Result<Option<GateGuard>, GateError> {
        let mut file = self.open_file()?;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => return Ok(Some(GateGuard { _lock: lock })),
                Err((returned, Errno::EAGAIN | Errno::EINTR)) => {
                    if cancel.is_requested() {
                        return Ok(None);
                    }
                    file = returned;
                    tokio::time::sleep(ACQUIRE_POLL).await;
                }
                Err((_, errno)) => return Err(GateError::Lock(errno)),
            }
        }
    }

    fn open_file(&self) -> Result<File, GateError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| GateError::Open {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::{GateFile, SharedGate};
    use crate::shutdown::ShutdownFlag;

    #[tokio::test]
    async fn uncontended_acquire_succeeds() {
        let file = GateFile::create().unwrap();
        let gate = file.gate();
        let guard = gate.acquire(&ShutdownFlag::new()).await.unwrap();
        assert!(guard.is_some());
    }

    #[tokio::test]
    async fn admits_one_holder_at_a_time() {
        let file = GateFile::create().unwrap();
        let holders = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gate = SharedGate::open(file.path()).unwrap();
            let holders = holders.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let guard = gate.acquire(&ShutdownFlag::new()).await.unwrap();
                    assert!(guard.is_some());
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    holders.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn contended_acquire_gives_up_on_cancel() {
        let file = GateFile::create().unwrap();
        let held = file.gate().acquire(&ShutdownFlag::new()).await.unwrap();
        assert!(held.is_some());

        let cancel = ShutdownFlag::new();
        let waiter = {
            let gate = file.gate();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&cancel).await.unwrap().is_some() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.request();

        let got_lock = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("acquire must return after cancellation")
            .unwrap();
        assert!(!got_lock);
    }

    #[tokio::test]
    async fn release_on_drop_lets_next_holder_in() {
        let file = GateFile::create().unwrap();
        let gate = file.gate();
        let first = gate.acquire(&ShutdownFlag::new()).await.unwrap();
        drop(first);
        let second = tokio::time::timeout(
            Duration::from_secs(1),
            gate.acquire(&ShutdownFlag::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(second.is_some());
    }

    #[test]
    fn open_fails_after_removal() {
        let file = GateFile::create().unwrap();
        let path = file.path().to_path_buf();
        file.remove();
        assert!(SharedGate::open(&path).is_err());
    }
}
