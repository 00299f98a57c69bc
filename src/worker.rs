//! Per-channel worker process: answers forwarded commands and periodically
//! announces itself in its channel.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncRead;

use crate::{
    backend::{credential_from_env, AiBackend, GeminiClient},
    config::WorkerArgs,
    connection::SharedConnection,
    gate::SharedGate,
    helpers::single_line,
    irc::privmsg,
    pipe::{PipeEvent, PipeMessage, PipeReader},
    shutdown::{install_child_handlers, ShutdownFlag},
};

const PIPE_WAIT: Duration = Duration::from_secs(1);

pub struct Worker<B> {
    index: usize,
    channel: String,
    conn: SharedConnection,
    backend: B,
    credential: Option<String>,
    exit: ShutdownFlag,
    announce_every: Duration,
    last_announce: Instant,
    pipe_wait: Duration,
}

impl<B: AiBackend> Worker<B> {
    pub fn new(
        index: usize,
        channel: impl Into<String>,
        conn: SharedConnection,
        backend: B,
        credential: Option<String>,
        exit: ShutdownFlag,
    ) -> Self {
        Self {
            index,
            channel: channel.into(),
            conn,
            backend,
            credential,
            exit,
            announce_every: Duration::from_secs(30),
            last_announce: Instant::now(),
            pipe_wait: PIPE_WAIT,
        }
    }

    pub fn with_announce_interval(mut self, every: Duration) -> Self {
        self.announce_every = every;
        self
    }

    pub fn with_pipe_wait(mut self, wait: Duration) -> Self {
        self.pipe_wait = wait;
        self
    }

    /// Serve the pipe until the exit flag is raised or the supervisor closes
    /// its end.
    pub async fn run<R: AsyncRead + Unpin>(&mut self, mut reader: PipeReader<R>) {
        tracing::info!(ai_enabled = self.credential.is_some(), "worker started");
        while !self.exit.is_requested() {
            match reader.next_event(self.pipe_wait).await {
                Ok(PipeEvent::Frame(frame)) => match PipeMessage::decode(&frame) {
                    Ok(message) => self.handle(message).await,
                    Err(error) => tracing::warn!(error = %error, frame = %frame, "dropping pipe frame"),
                },
                Ok(PipeEvent::Idle) => self.announce_if_due().await,
                Ok(PipeEvent::Closed) => {
                    tracing::info!("supervisor closed the pipe, exiting");
                    self.exit.request();
                }
                Err(error) => {
                    tracing::error!(error = %error, "pipe read failed, exiting");
                    self.exit.request();
                }
            }
        }
        self.conn.close();
        tracing::info!("worker exiting");
    }

    pub async fn handle(&self, message: PipeMessage) {
        let reply = match message {
            PipeMessage::Hello { sender, text } => format!(
                "Hello {sender}! Worker for {chan} received your message: \"{text}\"",
                chan = self.channel
            ),
            PipeMessage::Ask {
                sender,
                persona,
                prompt,
            } => self.answer(&sender, &persona, &prompt).await,
        };
        self.say(&reply).await;
    }

    async fn answer(&self, sender: &str, persona: &str, prompt: &str) -> String {
        let Some(credential) = self.credential.as_deref() else {
            tracing::info!(sender = %sender, "AI disabled, skipping !ask");
            return format!("{sender}, AI features are currently disabled.");
        };

        tracing::info!(sender = %sender, prompt = %prompt, "processing !ask");
        match self.backend.generate(persona, prompt, credential).await {
            Ok(reply) => format!("{sender}: {}", single_line(&reply)),
            Err(error) => {
                tracing::warn!(sender = %sender, error = %error, "AI request failed");
                format!("{sender}, I encountered an error trying to process your request.")
            }
        }
    }

    async fn announce_if_due(&mut self) {
        if self.last_announce.elapsed() < self.announce_every {
            return;
        }
        self.last_announce = Instant::now();
        let text = format!("My commands [ID {}]: !ask <prompt> !hello.", self.index);
        self.say(&text).await;
    }

    async fn say(&self, text: &str) {
        if let Err(error) = self.conn.send(&privmsg(&self.channel, text)).await {
            tracing::warn!(channel = %self.channel, error = %error, "failed to send to channel");
        }
    }
}

/// Entry point of the hidden `worker` role.
pub async fn run_worker(args: WorkerArgs) -> Result<()> {
    let exit = ShutdownFlag::new();
    install_child_handlers(exit.clone())?;

    let gate = match &args.link.gate {
        Some(path) => match SharedGate::open(path) {
            Ok(gate) => Some(gate),
            Err(error) => {
                tracing::warn!(error = %error, "socket gate unavailable, writes will be unlocked");
                None
            }
        },
        None => None,
    };
    // SAFETY: the supervisor hands this descriptor to us and nothing else in
    // this process claims it.
    let conn = unsafe { SharedConnection::from_inherited_fd(args.link.socket_fd, gate, exit.clone()) };

    let credential = credential_from_env();
    if credential.is_none() {
        tracing::warn!("GEMINIAI_API_KEY not set, AI features disabled for this worker");
    }
    let backend = GeminiClient::from_env().context("failed to build AI client")?;
    let reader = PipeReader::from_stdin().context("failed to attach to supervisor pipe")?;

    tracing::info!(persona = %args.persona, "worker ready");
    Worker::new(args.index, args.channel, conn, backend, credential, exit)
        .with_announce_interval(Duration::from_secs(args.announce_interval))
        .run(reader)
        .await;
    Ok(())
}
