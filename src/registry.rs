//! Children the supervisor owns: one pinger and one worker per managed
//! channel. Worker slots are kept for the whole run so a dead worker still
//! shows up in status reports.

use std::{
    process::ExitStatus,
    time::{Duration, Instant},
};

use nix::sys::signal::Signal;
use tokio::{io::AsyncWrite, process::Child};

use crate::{
    config::ChannelSpec,
    pipe::{PipeMessage, PipeSendError, WorkerPipe},
    spawner::{probe, signal_process},
};

const EXIT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Pinger,
    Worker { index: usize },
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Pinger => f.write_str("pinger"),
            Role::Worker { index } => write!(f, "worker {index}"),
        }
    }
}

/// A child that has exited and been waited for.
#[derive(Debug)]
pub struct Reaped {
    pub role: Role,
    pub pid: u32,
    pub status: Option<ExitStatus>,
}

#[derive(Debug, Default)]
pub struct ProcessRecord {
    child: Option<Child>,
    pid: Option<u32>,
}

impl ProcessRecord {
    fn track(&mut self, child: Child) {
        self.pid = child.id();
        self.child = Some(child);
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Pid of a tracked process that still answers a signal probe.
    pub fn active_pid(&self) -> Option<u32> {
        self.pid.filter(|pid| probe(*pid))
    }

    fn try_reap(&mut self) -> Option<(u32, Option<ExitStatus>)> {
        let child = self.child.as_mut()?;
        let status = match child.try_wait() {
            Ok(None) => return None,
            Ok(Some(status)) => Some(status),
            Err(error) => {
                tracing::warn!(pid = ?self.pid, error = %error, "wait on child failed, treating as exited");
                None
            }
        };
        self.child = None;
        let pid = self.pid.take().unwrap_or_default();
        Some((pid, status))
    }
}

#[derive(Debug)]
pub struct WorkerRecord {
    pub index: usize,
    pub channel: ChannelSpec,
    pub process: ProcessRecord,
    pipe: Option<WorkerPipe>,
}

impl WorkerRecord {
    pub fn pipe_open(&self) -> bool {
        self.pipe.is_some()
    }
}

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    pinger: ProcessRecord,
    workers: Vec<WorkerRecord>,
}

impl ProcessRegistry {
    /// One worker slot per channel after the admin channel.
    pub fn new(channels: &[ChannelSpec]) -> Self {
        let workers = channels
            .iter()
            .enumerate()
            .skip(1)
            .map(|(index, channel)| WorkerRecord {
                index,
                channel: channel.clone(),
                process: ProcessRecord::default(),
                pipe: None,
            })
            .collect();
        Self {
            pinger: ProcessRecord::default(),
            workers,
        }
    }

    pub fn pinger(&self) -> &ProcessRecord {
        &self.pinger
    }

    pub fn workers(&self) -> &[WorkerRecord] {
        &self.workers
    }

    pub fn worker(&self, index: usize) -> Option<&WorkerRecord> {
        self.workers.iter().find(|worker| worker.index == index)
    }

    fn worker_mut(&mut self, index: usize) -> Option<&mut WorkerRecord> {
        self.workers.iter_mut().find(|worker| worker.index == index)
    }

    /// Channel names compare case-insensitively, as IRC does.
    pub fn worker_for_channel(&self, channel: &str) -> Option<&WorkerRecord> {
        self.workers
            .iter()
            .find(|worker| worker.channel.name.eq_ignore_ascii_case(channel))
    }

    pub fn track_pinger(&mut self, child: Child) {
        self.pinger.track(child);
    }

    /// Track a worker and keep its stdin as the pipe write end.
    pub fn track_worker(&mut self, index: usize, mut child: Child) {
        let stdin = child.stdin.take();
        let Some(worker) = self.worker_mut(index) else {
            tracing::warn!(index, "no worker slot for spawned child");
            return;
        };
        worker.process.track(child);
        match stdin {
            Some(stdin) => worker.pipe = Some(WorkerPipe::new(stdin)),
            None => tracing::warn!(channel = %worker.channel.name, "worker spawned without a pipe"),
        }
    }

    pub fn open_pipe(&mut self, index: usize, writer: impl AsyncWrite + Send + Unpin + 'static) {
        if let Some(worker) = self.worker_mut(index) {
            worker.pipe = Some(WorkerPipe::new(writer));
        }
    }

    pub fn close_pipe(&mut self, index: usize) {
        if let Some(worker) = self.worker_mut(index) {
            worker.pipe = None;
        }
    }

    /// Forward to a worker. A failed write closes that worker's pipe; encoding
    /// failures leave it open.
    pub async fn forward(&mut self, index: usize, message: &PipeMessage) -> Result<bool, PipeSendError> {
        let Some(worker) = self.worker_mut(index) else {
            return Ok(false);
        };
        let Some(pipe) = worker.pipe.as_mut() else {
            return Ok(false);
        };
        match pipe.send(message).await {
            Ok(()) => Ok(true),
            Err(error @ PipeSendError::Io(_)) => {
                tracing::warn!(channel = %worker.channel.name, error = %error, "worker pipe broken, closing it");
                worker.pipe = None;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Collect every child that has exited, without blocking.
    pub fn reap(&mut self) -> Vec<Reaped> {
        let mut reaped = Vec::new();
        if let Some((pid, status)) = self.pinger.try_reap() {
            reaped.push(Reaped {
                role: Role::Pinger,
                pid,
                status,
            });
        }
        for worker in &mut self.workers {
            if let Some((pid, status)) = worker.process.try_reap() {
                worker.pipe = None;
                reaped.push(Reaped {
                    role: Role::Worker {
                        index: worker.index,
                    },
                    pid,
                    status,
                });
            }
        }
        reaped
    }

    pub fn live_children(&self) -> usize {
        let workers = self
            .workers
            .iter()
            .filter(|worker| worker.process.child.is_some())
            .count();
        workers + usize::from(self.pinger.child.is_some())
    }

    /// SIGTERM the pinger, then close each worker's pipe and SIGTERM it. Poll
    /// for exits until `grace` runs out and SIGKILL whatever is left.
    pub async fn terminate_all(&mut self, grace: Duration) {
        if let Some(pid) = self.pinger.pid {
            tracing::info!(pid, "terminating pinger");
            signal_process(pid, Signal::SIGTERM);
        }
        for worker in &mut self.workers {
            worker.pipe = None;
            if let Some(pid) = worker.process.pid {
                tracing::info!(pid, channel = %worker.channel.name, "terminating worker");
                signal_process(pid, Signal::SIGTERM);
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            for exited in self.reap() {
                tracing::info!(role = %exited.role, pid = exited.pid, status = ?exited.status, "child exited");
            }
            if self.live_children() == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }

        let records = std::iter::once(&mut self.pinger)
            .chain(self.workers.iter_mut().map(|worker| &mut worker.process));
        for record in records {
            let Some(mut child) = record.child.take() else {
                continue;
            };
            if let Some(pid) = record.pid.take() {
                tracing::warn!(pid, "child still running after grace period, killing");
                signal_process(pid, Signal::SIGKILL);
            }
            if let Err(error) = child.wait().await {
                tracing::warn!(error = %error, "wait after SIGKILL failed");
            }
        }
    }

    /// Forget every child and pipe. Worker slots are kept.
    pub fn clear(&mut self) {
        self.pinger = ProcessRecord::default();
        for worker in &mut self.workers {
            worker.process = ProcessRecord::default();
            worker.pipe = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{process::Stdio, time::Duration};

    use tokio::{io::AsyncBufReadExt, process::Command};

    use super::{ProcessRegistry, Role};
    use crate::{config::ChannelSpec, pipe::PipeMessage, spawner::probe};

    fn channels() -> Vec<ChannelSpec> {
        ["#admin", "#one", "#Two"]
            .into_iter()
            .map(|name| ChannelSpec {
                name: name.into(),
                persona: "p".into(),
            })
            .collect()
    }

    fn sleeper(secs: &str, piped: bool) -> tokio::process::Child {
        let mut cmd = Command::new("sleep");
        cmd.arg(secs);
        if piped {
            cmd.stdin(Stdio::piped());
        }
        cmd.spawn().unwrap()
    }

    #[test]
    fn slots_cover_non_admin_channels() {
        let registry = ProcessRegistry::new(&channels());
        assert_eq!(registry.workers().len(), 2);
        assert_eq!(registry.workers()[0].index, 1);
        assert_eq!(registry.worker_for_channel("#two").map(|w| w.index), Some(2));
        assert!(registry.worker_for_channel("#admin").is_none());
    }

    #[tokio::test]
    async fn tracked_worker_gets_pipe_and_terminates() {
        let mut registry = ProcessRegistry::new(&channels());
        registry.track_pinger(sleeper("30", false));
        registry.track_worker(1, sleeper("30", true));
        registry.track_worker(2, sleeper("30", false));

        assert!(registry.worker(1).unwrap().pipe_open());
        assert!(!registry.worker(2).unwrap().pipe_open());
        assert!(registry.pinger().active_pid().is_some());
        assert_eq!(registry.live_children(), 3);

        tokio::time::timeout(Duration::from_secs(5), registry.terminate_all(Duration::from_secs(2)))
            .await
            .expect("terminate_all must finish");
        assert_eq!(registry.live_children(), 0);
        assert!(!registry.worker(1).unwrap().pipe_open());
        assert!(registry.worker(1).unwrap().process.pid().is_none());
    }

    #[tokio::test]
    async fn child_ignoring_sigterm_is_killed_after_grace() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; echo ready; while true; do sleep 0.1; done")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut lines = tokio::io::BufReader::new(stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ready"));

        let mut registry = ProcessRegistry::new(&channels());
        registry.track_worker(1, child);
        let pid = registry.worker(1).unwrap().process.pid().unwrap();

        let grace = Duration::from_millis(500);
        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(5), registry.terminate_all(grace))
            .await
            .expect("terminate_all must finish");
        assert!(started.elapsed() >= grace);
        assert_eq!(registry.live_children(), 0);
        assert!(registry.worker(1).unwrap().process.pid().is_none());
        assert!(!probe(pid));
    }

    #[tokio::test]
    async fn reap_reports_exited_children_once() {
        let mut registry = ProcessRegistry::new(&channels());
        registry.track_worker(1, sleeper("0", true));

        let mut reaped = Vec::new();
        for _ in 0..100 {
            reaped.extend(registry.reap());
            if !reaped.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].role, Role::Worker { index: 1 });
        assert!(reaped[0].status.is_some_and(|status| status.success()));
        assert!(!registry.worker(1).unwrap().pipe_open());
        assert!(registry.reap().is_empty());
    }

    #[tokio::test]
    async fn forward_writes_frames_to_pipe() {
        let mut registry = ProcessRegistry::new(&channels());
        let (write, read) = tokio::io::duplex(256);
        registry.open_pipe(2, write);

        let message = PipeMessage::Hello {
            sender: "bob".into(),
            text: "!hello".into(),
        };
        assert!(registry.forward(2, &message).await.unwrap());
        assert!(!registry.forward(1, &message).await.unwrap());

        let mut lines = tokio::io::BufReader::new(read).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("HELLO\tbob\t!hello"));
    }

    #[tokio::test]
    async fn clear_keeps_slots() {
        let mut registry = ProcessRegistry::new(&channels());
        let (write, _read) = tokio::io::duplex(16);
        registry.open_pipe(1, write);
        registry.clear();
        assert_eq!(registry.workers().len(), 2);
        assert!(!registry.worker(1).unwrap().pipe_open());
    }
}
