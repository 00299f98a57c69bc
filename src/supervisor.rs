//! The supervisor: owns the connection and every child, routes inbound lines,
//! and tears everything down in order on exit.

use std::{os::fd::AsRawFd, time::Duration};

use anyhow::{Context, Result};
use tokio::{sync::mpsc, time::timeout};

use crate::{
    config::BotConfig,
    connection::{self, Inbound, SendError, SharedConnection},
    gate::GateFile,
    mute::MuteSet,
    registry::{ProcessRegistry, Role},
    router::{Action, Router},
    shutdown::{install_supervisor_handlers, ShutdownFlag},
    spawner::Spawner,
};

/// Timing knobs for the loop and for teardown.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub quit_message: String,
    pub quit_pause: Duration,
    pub grace: Duration,
    pub inbound_wait: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            quit_message: "Leaving now! Goodbyeeee...".to_string(),
            quit_pause: Duration::from_millis(500),
            grace: Duration::from_secs(10),
            inbound_wait: Duration::from_secs(1),
        }
    }
}

pub struct Supervisor {
    conn: SharedConnection,
    inbound: mpsc::Receiver<Inbound>,
    router: Router,
    registry: ProcessRegistry,
    shutdown: ShutdownFlag,
    settings: SupervisorSettings,
    gate_file: Option<GateFile>,
    finished: bool,
}

impl Supervisor {
    pub fn new(
        conn: SharedConnection,
        inbound: mpsc::Receiver<Inbound>,
        router: Router,
        registry: ProcessRegistry,
        shutdown: ShutdownFlag,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            conn,
            inbound,
            router,
            registry,
            shutdown,
            settings,
            gate_file: None,
            finished: false,
        }
    }

    /// Hand over the gate lock file so teardown removes it last.
    pub fn with_gate_file(mut self, gate_file: Option<GateFile>) -> Self {
        self.gate_file = gate_file;
        self
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ProcessRegistry {
        &mut self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Register, join every channel, then start the pinger and the workers.
    pub async fn start(&mut self, config: &BotConfig, spawner: &Spawner) -> Result<()> {
        connection::register(&self.conn, &mut self.inbound, &config.identity, &self.shutdown).await?;
        connection::join_channels(&self.conn, &config.channels, &config.admin_key, &self.shutdown).await?;
        self.spawn_children(config, spawner).await
    }

    /// All children start or none stay running.
    async fn spawn_children(&mut self, config: &BotConfig, spawner: &Spawner) -> Result<()> {
        if let Err(error) = self.try_spawn_children(config, spawner) {
            tracing::error!(error = %error, "spawn failed, stopping children already started");
            self.stop_children().await;
            return Err(error);
        }
        tracing::info!(workers = self.registry.workers().len(), "all children started");
        Ok(())
    }

    async fn stop_children(&mut self) {
        self.registry.terminate_all(self.settings.grace).await;
        self.registry.clear();
    }

    fn try_spawn_children(&mut self, config: &BotConfig, spawner: &Spawner) -> Result<()> {
        let pinger = spawner.spawn_pinger(&config.host, config.ping_interval)?;
        tracing::info!(pid = ?pinger.id(), "started pinger");
        self.registry.track_pinger(pinger);

        for (index, channel) in config.channels.iter().enumerate().skip(1) {
            let worker = spawner.spawn_worker(index, channel, config.announce_interval)?;
            tracing::info!(pid = ?worker.id(), channel = %channel.name, "started worker");
            self.registry.track_worker(index, worker);
        }
        Ok(())
    }

    pub async fn run(&mut self) {
        tracing::info!("entering main loop");
        while !self.shutdown.is_requested() {
            self.step().await;
        }
        tracing::info!("main loop finished");
    }

    /// One loop iteration: wait briefly for a line, route it, reap children.
    pub async fn step(&mut self) {
        match timeout(self.settings.inbound_wait, self.inbound.recv()).await {
            Err(_) => {}
            Ok(None) => {
                tracing::warn!("server closed the connection");
                self.shutdown.request();
            }
            Ok(Some(Inbound::Failed(error))) => {
                tracing::error!(error = %error, "socket read failed");
                self.shutdown.request();
            }
            Ok(Some(Inbound::Line(line))) => {
                tracing::info!(target: "irc_relay_bot::wire", line = %line, "recv");
                let actions = self.router.route(&line, &self.registry);
                self.execute(actions).await;
            }
        }
        self.reap();
    }

    pub async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(line) => match self.conn.send(&line).await {
                    Ok(()) => {}
                    Err(SendError::Cancelled) => return,
                    Err(error) => {
                        tracing::error!(error = %error, "write to server failed");
                        self.shutdown.request();
                        return;
                    }
                },
                Action::Pause(pause) => tokio::time::sleep(pause).await,
                Action::Forward { worker, message } => {
                    match self.registry.forward(worker, &message).await {
                        Ok(true) => tracing::debug!(worker, verb = message.verb(), "forwarded to worker"),
                        Ok(false) => tracing::debug!(worker, "worker pipe closed, message dropped"),
                        Err(error) => tracing::warn!(worker, error = %error, "failed to forward to worker"),
                    }
                }
            }
        }
    }

    fn reap(&mut self) {
        for exited in self.registry.reap() {
            match exited.role {
                Role::Pinger => {
                    tracing::error!(pid = exited.pid, status = ?exited.status, "pinger exited, shutting down");
                    self.shutdown.request();
                }
                Role::Worker { index } => {
                    let channel = self
                        .registry
                        .worker(index)
                        .map(|worker| worker.channel.name.as_str())
                        .unwrap_or_default();
                    tracing::warn!(pid = exited.pid, channel = %channel, status = ?exited.status, "worker exited");
                }
            }
        }
    }

    /// Say goodbye, stop every child, close the socket. Safe to call more
    /// than once.
    pub async fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.shutdown.request();
        tracing::info!("shutting down");

        if !self.conn.is_closed() {
            let quit = format!("QUIT :{}", self.settings.quit_message);
            if let Err(error) = self.conn.send(&quit).await {
                tracing::warn!(error = %error, "could not send QUIT");
            }
            tokio::time::sleep(self.settings.quit_pause).await;
        }

        self.registry.terminate_all(self.settings.grace).await;
        self.conn.close();
        self.registry.clear();
        if let Some(gate_file) = self.gate_file.take() {
            gate_file.remove();
        }
        tracing::info!("shutdown complete");
    }
}

/// Run the bot until a signal, a lost connection, or a dead pinger stops it.
pub async fn run_bot(config: BotConfig) -> Result<()> {
    let shutdown = ShutdownFlag::new();
    install_supervisor_handlers(shutdown.clone())?;

    let mutes = MuteSet::load(&config.mute_file).context("failed to load mute list")?;
    let gate_file = match GateFile::create() {
        Ok(file) => Some(file),
        Err(error) => {
            tracing::warn!(error = %error, "could not create socket gate, writes will be unlocked");
            None
        }
    };
    let gate = gate_file.as_ref().map(GateFile::gate);

    let stream = connection::connect(&config.host, config.port).await?;
    let socket_fd = stream.as_raw_fd();
    let reader = stream.try_clone().context("failed to clone IRC socket for reading")?;
    let conn = SharedConnection::new(stream, gate, shutdown.clone())
        .context("failed to set up IRC connection")?;
    let inbound = connection::spawn_reader(reader);

    let spawner = Spawner::new(
        socket_fd,
        gate_file.as_ref().map(GateFile::path),
        &config.log_file,
    );
    let router = Router::new(
        config.identity.nick.clone(),
        config.admin_channel().name.clone(),
        mutes,
    );
    let settings = SupervisorSettings {
        quit_message: config.quit_message.clone(),
        ..SupervisorSettings::default()
    };
    let mut supervisor = Supervisor::new(
        conn,
        inbound,
        router,
        ProcessRegistry::new(&config.channels),
        shutdown,
        settings,
    )
    .with_gate_file(gate_file);

    let started = supervisor.start(&config, &spawner).await;
    if started.is_ok() {
        supervisor.run().await;
    }
    supervisor.shutdown().await;
    started
}
