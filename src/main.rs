use std::{fs::OpenOptions, path::Path, sync::Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Instrument;
use tracing_subscriber::{
    fmt::{format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use irc_relay_bot::{
    config::{BotConfig, Cli, RoleCommand},
    pinger::run_pinger,
    supervisor::run_bot,
    worker::run_worker,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_file);

    match cli.role {
        Some(RoleCommand::Pinger(args)) => {
            let span = tracing::info_span!("pinger", pid = std::process::id());
            run_pinger(args).instrument(span).await
        }
        Some(RoleCommand::Worker(args)) => {
            let span = tracing::info_span!(
                "worker",
                pid = std::process::id(),
                index = args.index,
                channel = %args.channel
            );
            run_worker(args).instrument(span).await
        }
        None => {
            let span = tracing::info_span!("supervisor", pid = std::process::id());
            async {
                let config = BotConfig::from_cli(cli).context("invalid configuration")?;
                let result = run_bot(config).await;
                if let Err(error) = &result {
                    tracing::error!(error = %format!("{error:#}"), "bot stopped with an error");
                }
                result
            }
            .instrument(span)
            .await
        }
    }
}

struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Stderr plus an append-only log file shared by every process of the run.
fn init_tracing(log_file: &Path) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(LocalTime)
        .with_target(true)
        .with_filter(filter());

    let file = match OpenOptions::new().create(true).append(true).open(log_file) {
        Ok(file) => Some(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_timer(LocalTime)
                .with_ansi(false)
                .with_filter(filter()),
        ),
        Err(error) => {
            eprintln!("could not open log file {}: {error}", log_file.display());
            None
        }
    };

    let _ = tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .try_init();
}
