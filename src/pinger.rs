//! Keep-alive process: PINGs the server on a fixed interval.

use std::time::Duration;

use anyhow::Result;

use crate::{
    config::PingerArgs,
    connection::{SendError, SharedConnection},
    gate::SharedGate,
    shutdown::{install_child_handlers, ShutdownFlag},
};

const TICK: Duration = Duration::from_secs(1);

pub struct Pinger {
    conn: SharedConnection,
    server: String,
    interval: Duration,
    tick: Duration,
    exit: ShutdownFlag,
}

impl Pinger {
    pub fn new(conn: SharedConnection, server: impl Into<String>, interval: Duration, exit: ShutdownFlag) -> Self {
        Self {
            conn,
            server: server.into(),
            interval,
            tick: TICK,
            exit,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub async fn run(&self) {
        tracing::info!(interval_secs = self.interval.as_secs(), "pinger started");
        loop {
            if !self.wait_interval().await {
                break;
            }
            match self.conn.send(&format!("PING :{}", self.server)).await {
                Ok(()) => {}
                Err(SendError::Cancelled) => break,
                Err(error) => tracing::warn!(error = %error, "keep-alive PING failed"),
            }
        }
        self.conn.close();
        tracing::info!("pinger exiting");
    }

    /// Sleep for one interval in short ticks. Returns false once the exit flag
    /// is raised.
    async fn wait_interval(&self) -> bool {
        let mut waited = Duration::ZERO;
        while waited < self.interval {
            if self.exit.is_requested() {
                return false;
            }
            let step = self.tick.min(self.interval - waited);
            tokio::time::sleep(step).await;
            waited += step;
        }
        !self.exit.is_requested()
    }
}

/// Entry point of the hidden `pinger` role.
pub async fn run_pinger(args: PingerArgs) -> Result<()> {
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

    Pinger::new(conn, args.server, Duration::from_secs(args.interval), exit)
        .run()
        .await;
    Ok(())
}
