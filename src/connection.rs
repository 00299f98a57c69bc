//! The IRC connection shared by the supervisor, the pinger and every worker.
//!
//! Only the supervisor reads from the socket (see [`spawn_reader`]). Every
//! process writes through its own [`SharedConnection`], which takes the
//! [`SharedGate`] around each complete line so lines from different processes
//! never interleave on the wire.

use std::{
    io::{self, BufRead, BufReader, ErrorKind, Read, Write},
    net::{Shutdown, TcpStream},
    os::fd::{FromRawFd, RawFd},
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::{sync::mpsc, time::timeout};

use crate::{
    config::{ChannelSpec, Identity},
    gate::SharedGate,
    helpers::{floor_char_boundary, single_line},
    irc::{ping_token, redact_keys, IrcLine},
    shutdown::ShutdownFlag,
};

/// RFC 1459 line limit, CRLF included.
pub const MAX_IRC_LINE: usize = 512;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);
const INBOUND_POLL: Duration = Duration::from_secs(1);
const ADMIN_MODE_DELAY: Duration = Duration::from_millis(200);
const JOIN_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error("send abandoned: shutdown requested")]
    Cancelled,
    #[error("socket write failed: {0}")]
    Io(#[from] io::Error),
}

/// One inbound event from the socket reader thread. The channel closing means
/// the server hung up.
#[derive(Debug)]
pub enum Inbound {
    Line(String),
    Failed(io::Error),
}

pub struct SharedConnection {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    socket: Mutex<Option<TcpStream>>,
    gate: Option<SharedGate>,
    cancel: ShutdownFlag,
}

impl std::fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnection")
            .field("open", &!self.is_closed())
            .field("gate", &self.gate)
            .finish()
    }
}

impl SharedConnection {
    /// Supervisor side: owns the socket and may shut it down.
    pub fn new(
        stream: TcpStream,
        gate: Option<SharedGate>,
        cancel: ShutdownFlag,
    ) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            writer: Mutex::new(Some(Box::new(writer))),
            socket: Mutex::new(Some(stream)),
            gate,
            cancel,
        })
    }

    /// Child side: writes to a socket descriptor inherited from the
    /// supervisor. Closing this handle never shuts the socket down for others.
    ///
    /// # Safety
    ///
    /// `fd` must be an open socket descriptor that nothing else in this
    /// process owns.
    pub unsafe fn from_inherited_fd(
        fd: RawFd,
        gate: Option<SharedGate>,
        cancel: ShutdownFlag,
    ) -> Self {
        let stream = unsafe { TcpStream::from_raw_fd(fd) };
        Self::from_writer(stream, gate, cancel)
    }

    pub fn from_writer(
        writer: impl Write + Send + 'static,
        gate: Option<SharedGate>,
        cancel: ShutdownFlag,
    ) -> Self {
        Self {
            writer: Mutex::new(Some(Box::new(writer))),
            socket: Mutex::new(None),
            gate,
            cancel,
        }
    }

    /// Send one IRC line. The gate is held for the whole write and released on
    /// every exit path.
    pub async fn send(&self, line: &str) -> Result<(), SendError> {
        let frame = frame_line(line);

        let _guard = match &self.gate {
            Some(gate) => match gate.acquire(&self.cancel).await {
                Ok(Some(guard)) => Some(guard),
                Ok(None) => {
                    tracing::warn!(line = %redact_keys(line), "send aborted: shutdown during gate wait");
                    return Err(SendError::Cancelled);
                }
                Err(error) => {
                    tracing::warn!(error = %error, "socket gate unavailable, sending without lock");
                    None
                }
            },
            None => {
                tracing::warn!("no socket gate configured, sending without lock");
                None
            }
        };

        self.write_frame(frame.as_bytes())?;
        tracing::info!(target: "irc_relay_bot::wire", line = %redact_keys(frame.trim_end()), "sent");
        Ok(())
    }

    fn write_frame(&self, bytes: &[u8]) -> Result<(), SendError> {
        let mut slot = self.writer.lock();
        let writer = slot.as_mut().ok_or(SendError::Closed)?;
        let mut written = 0;
        while written < bytes.len() {
            match writer.write(&bytes[written..]) {
                Ok(0) => return Err(SendError::Io(ErrorKind::WriteZero.into())),
                Ok(n) => written += n,
                Err(error) if error.kind() == ErrorKind::Interrupted => {
                    if self.cancel.is_requested() {
                        tracing::warn!(written, total = bytes.len(), "send aborted: shutdown during write");
                        return Err(SendError::Cancelled);
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// Shut the socket down and drop the writer. Returns whether anything was
    /// still open.
    pub fn close(&self) -> bool {
        let writer = self.writer.lock().take();
        let socket = self.socket.lock().take();
        if let Some(stream) = &socket {
            if let Err(error) = stream.shutdown(Shutdown::Both) {
                if error.kind() != ErrorKind::NotConnected {
                    tracing::warn!(error = %error, "failed to shut down IRC socket");
                }
            }
        }
        let was_open = writer.is_some() || socket.is_some();
        if was_open {
            tracing::info!("IRC socket closed");
        }
        was_open
    }

    pub fn is_closed(&self) -> bool {
        self.writer.lock().is_none()
    }
}

/// Cap at the IRC line limit and terminate with CRLF.
fn frame_line(line: &str) -> String {
    let mut text = single_line(line);
    let limit = MAX_IRC_LINE - 2;
    if text.len() > limit {
        let cut = floor_char_boundary(&text, limit);
        tracing::debug!(len = text.len(), limit, "outbound IRC line truncated");
        text.truncate(cut);
    }
    text.push_str("\r\n");
    text
}

/// Open the TCP connection. The returned stream is in blocking mode.
pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
    tracing::info!(host = %host, port, "connecting to IRC server");
    let stream = timeout(CONNECT_TIMEOUT, tokio::net::TcpStream::connect((host, port)))
        .await
        .with_context(|| format!("connection to {host}:{port} timed out"))?
        .with_context(|| format!("failed to connect to {host}:{port}"))?;
    let stream = stream
        .into_std()
        .context("failed to detach IRC socket from runtime")?;
    stream
        .set_nonblocking(false)
        .context("failed to switch IRC socket to blocking mode")?;
    if let Ok(peer) = stream.peer_addr() {
        tracing::info!(peer = %peer, "connected to IRC server");
    }
    Ok(stream)
}

/// Read CRLF-terminated lines on a dedicated thread. The receiver closes when
/// the server hangs up or the socket is shut down.
pub fn spawn_reader(source: impl Read + Send + 'static) -> mpsc::Receiver<Inbound> {
    let (tx, rx) = mpsc::channel(256);
    std::thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);
                    if line.is_empty() {
                        continue;
                    }
                    if tx.blocking_send(Inbound::Line(line.to_string())).is_err() {
                        break;
                    }
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    let _ = tx.blocking_send(Inbound::Failed(error));
                    break;
                }
            }
        }
    });
    rx
}

/// Send NICK/USER and wait for the end of the MOTD (376) or its absence (422),
/// answering server PINGs meanwhile.
pub async fn register(
    conn: &SharedConnection,
    inbound: &mut mpsc::Receiver<Inbound>,
    identity: &Identity,
    cancel: &ShutdownFlag,
) -> Result<()> {
    conn.send(&format!("NICK {}", identity.nick))
        .await
        .context("failed to send NICK")?;
    conn.send(&format!("USER {} 0 * :{}", identity.user, identity.realname))
        .await
        .context("failed to send USER")?;
    tracing::info!(nick = %identity.nick, "registration sent, waiting for end of MOTD");

    let started = Instant::now();
    loop {
        if cancel.is_requested() {
            bail!("shutdown requested during registration");
        }
        let remaining = REGISTRATION_TIMEOUT.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            bail!(
                "timed out waiting for end of MOTD after {}s",
                REGISTRATION_TIMEOUT.as_secs()
            );
        }

        let line = match timeout(remaining.min(INBOUND_POLL), inbound.recv()).await {
            Err(_) => continue,
            Ok(None) => bail!("server closed the connection during registration"),
            Ok(Some(Inbound::Failed(error))) => {
                return Err(error).context("read failed during registration")
            }
            Ok(Some(Inbound::Line(line))) => line,
        };
        tracing::debug!(target: "irc_relay_bot::wire", line = %line, "recv (registration)");

        if let Some(token) = ping_token(&line) {
            conn.send(&format!("PONG :{token}")).await?;
            continue;
        }
        if IrcLine::parse(&line).is_some_and(|parsed| matches!(parsed.command, "376" | "422")) {
            tracing::info!("IRC registration complete");
            return Ok(());
        }
    }
}

/// Join the admin channel with its key and lock it, then every worker channel.
pub async fn join_channels(
    conn: &SharedConnection,
    channels: &[ChannelSpec],
    admin_key: &str,
    cancel: &ShutdownFlag,
) -> Result<()> {
    for (index, channel) in channels.iter().enumerate() {
        if cancel.is_requested() {
            bail!("shutdown requested while joining {}", channel.name);
        }
        if index == 0 {
            conn.send(&format!("JOIN {} {}", channel.name, admin_key))
                .await?;
            tokio::time::sleep(ADMIN_MODE_DELAY).await;
            conn.send(&format!("MODE {} +k {}", channel.name, admin_key))
                .await?;
            tracing::info!(channel = %channel.name, "joined admin channel with key");
        } else {
            conn.send(&format!("JOIN {}", channel.name)).await?;
            tracing::info!(channel = %channel.name, "joined channel");
        }
        tokio::time::sleep(JOIN_DELAY).await;
    }
    Ok(())
}
