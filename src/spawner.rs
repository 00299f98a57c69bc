use std::{
    ffi::OsString,
    os::fd::RawFd,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::process::{Child, Command};

use crate::config::ChannelSpec;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn {role}: {source}")]
    Spawn {
        role: String,
        #[source]
        source: std::io::Error,
    },
    #[error("spawned {role} has no pid")]
    MissingPid { role: String },
}

/// Re-executes this binary into its hidden child roles. Every child inherits
/// the shared socket under its current descriptor number.
#[derive(Debug, Clone)]
pub struct Spawner {
    program: PathBuf,
    /// Placed before the role, for launching through a wrapper.
    program_args: Vec<OsString>,
    socket_fd: RawFd,
    gate: Option<PathBuf>,
    log_file: PathBuf,
}

impl Spawner {
    pub fn new(socket_fd: RawFd, gate: Option<&Path>, log_file: &Path) -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| "irc-relay-bot".into());
        Self {
            program,
            program_args: Vec::new(),
            socket_fd,
            gate: gate.map(Path::to_path_buf),
            log_file: log_file.to_path_buf(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_program(mut self, program: &str, args: &[&str]) -> Self {
        self.program = program.into();
        self.program_args = args.iter().map(OsString::from).collect();
        self
    }

    pub fn spawn_pinger(&self, server: &str, interval: Duration) -> Result<Child, SpawnError> {
        let mut cmd = self.pinger_command(server, interval);
        cmd.stdin(Stdio::null());
        spawn(cmd, "pinger")
    }

    /// The worker's stdin is a fresh pipe; the caller keeps the write end.
    pub fn spawn_worker(
        &self,
        index: usize,
        channel: &ChannelSpec,
        announce_interval: Duration,
    ) -> Result<Child, SpawnError> {
        let mut cmd = self.worker_command(index, channel, announce_interval);
        cmd.stdin(Stdio::piped());
        spawn(cmd, &format!("worker for {}", channel.name))
    }

    fn pinger_command(&self, server: &str, interval: Duration) -> Command {
        let mut cmd = self.base_command("pinger");
        cmd.arg("--server")
            .arg(server)
            .arg("--interval")
            .arg(interval.as_secs().to_string());
        cmd
    }

    fn worker_command(&self, index: usize, channel: &ChannelSpec, announce_interval: Duration) -> Command {
        let mut cmd = self.base_command("worker");
        cmd.arg("--index")
            .arg(index.to_string())
            .arg("--channel")
            .arg(&channel.name)
            .arg("--persona")
            .arg(&channel.persona)
            .arg("--announce-interval")
            .arg(announce_interval.as_secs().to_string());
        cmd
    }

    fn base_command(&self, role: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.program_args)
            .arg(role)
            .arg("--socket-fd")
            .arg(self.socket_fd.to_string());
        if let Some(gate) = &self.gate {
            cmd.arg("--gate").arg(gate);
        }
        cmd.arg("--log-file").arg(&self.log_file);
        cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        inherit_fd(&mut cmd, self.socket_fd);
        cmd
    }
}

fn spawn(mut cmd: Command, role: &str) -> Result<Child, SpawnError> {
    let child = cmd.spawn().map_err(|source| SpawnError::Spawn {
        role: role.to_string(),
        source,
    })?;
    if child.id().is_none() {
        return Err(SpawnError::MissingPid {
            role: role.to_string(),
        });
    }
    Ok(child)
}

/// Keep `fd` open across exec in the child only.
pub(crate) fn inherit_fd(cmd: &mut Command, fd: RawFd) {
    // SAFETY: fcntl is async-signal-safe and touches only the child's
    // descriptor table.
    unsafe {
        cmd.pre_exec(move || {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Send `signal` to `pid`. Returns false when the process is already gone.
pub fn signal_process(pid: u32, signal: Signal) -> bool {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(error) => {
            tracing::warn!(pid, signal = ?signal, error = %error, "failed to signal process");
            false
        }
    }
}

/// Whether a process with this pid still exists.
pub fn probe(pid: u32) -> bool {
    !matches!(
        kill(Pid::from_raw(pid as i32), None::<Signal>),
        Err(Errno::ESRCH)
    )
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, os::fd::AsRawFd, path::Path, time::Duration};

    use tokio::process::Command;

    use nix::sys::signal::Signal;

    use super::{inherit_fd, probe, signal_process, Spawner};
    use crate::config::ChannelSpec;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn worker_command_carries_link_and_channel() {
        let spawner = Spawner::new(5, Some(Path::new("/tmp/g.lock")), Path::new("bot.log"));
        let channel = ChannelSpec {
            name: "#rust".into(),
            persona: "-be terse-".into(),
        };
        let cmd = spawner.worker_command(3, &channel, Duration::from_secs(30));
        assert_eq!(
            args(&cmd),
            vec![
                "worker", "--socket-fd", "5", "--gate", "/tmp/g.lock", "--log-file", "bot.log",
                "--index", "3", "--channel", "#rust", "--persona", "-be terse-",
                "--announce-interval", "30",
            ]
        );
    }

    #[test]
    fn pinger_command_omits_missing_gate() {
        let spawner = Spawner::new(4, None, Path::new("bot.log"));
        let cmd = spawner.pinger_command("irc.test", Duration::from_secs(15));
        assert_eq!(
            args(&cmd),
            vec![
                "pinger", "--socket-fd", "4", "--log-file", "bot.log", "--server", "irc.test",
                "--interval", "15",
            ]
        );
    }

    #[tokio::test]
    #[cfg(target_os = "linux")]
    async fn inherited_socket_survives_exec() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        let script = format!("test -S /proc/self/fd/{fd}");

        let status = Command::new("sh").arg("-c").arg(&script).status().await.unwrap();
        assert!(!status.success(), "std sockets are close-on-exec by default");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&script);
        inherit_fd(&mut cmd, fd);
        assert!(cmd.status().await.unwrap().success());
    }

    #[tokio::test]
    async fn signal_and_probe_track_process_lifetime() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(probe(pid));
        assert!(signal_process(pid, Signal::SIGTERM));
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[test]
    fn probe_reports_missing_pid() {
        assert!(probe(std::process::id()));
        assert!(!probe(4_000_000));
    }
}
