use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, Subcommand};

pub const MAX_CHANNEL_NAME_LEN: usize = 64;
pub const MAX_PERSONA_LEN: usize = 256;
pub const DEFAULT_PERSONA: &str = "You are a helpful IRC bot assistant.";
pub const CREDENTIAL_ENV: &str = "GEMINIAI_API_KEY";

#[derive(Debug, Parser)]
#[command(name = "irc-relay-bot")]
#[command(about = "IRC bot that hands per-channel work to worker processes")]
#[command(subcommand_negates_reqs = true)]
pub struct Cli {
    #[command(subcommand)]
    pub role: Option<RoleCommand>,

    /// IRC server host name or address
    #[arg(required = true)]
    pub host: Option<String>,

    /// IRC server port
    #[arg(required = true)]
    pub port: Option<u16>,

    #[arg(long, default_value = "bdoke1272")]
    pub nick: String,

    /// Defaults to the nick
    #[arg(long)]
    pub user: Option<String>,

    /// Defaults to the nick
    #[arg(long)]
    pub realname: Option<String>,

    #[arg(long, default_value = "channels.txt")]
    pub channels_file: PathBuf,

    #[arg(long, default_value = "muted_users.txt")]
    pub mute_file: PathBuf,

    #[arg(long, env = "IRC_ADMIN_KEY", default_value = "mysecretpassword", hide_env_values = true)]
    pub admin_key: String,

    /// Seconds between keep-alive PINGs
    #[arg(long, default_value_t = 15)]
    pub ping_interval: u64,

    /// Seconds between worker self-announcements
    #[arg(long, default_value_t = 30)]
    pub announce_interval: u64,

    #[arg(long, default_value = "Leaving now! Goodbyeeee...")]
    pub quit_message: String,

    /// Append-only log file shared by every process of the run
    #[arg(long, global = true, default_value = "irc_chat.log")]
    pub log_file: PathBuf,
}

/// Internal roles the supervisor re-executes this binary into.
#[derive(Debug, Subcommand)]
pub enum RoleCommand {
    #[command(hide = true)]
    Pinger(PingerArgs),
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// What a child needs to reach the shared connection.
#[derive(Debug, Clone, clap::Args)]
pub struct ChildLink {
    /// Inherited socket descriptor
    #[arg(long)]
    pub socket_fd: i32,

    /// Gate lock file created by the supervisor
    #[arg(long)]
    pub gate: Option<PathBuf>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct PingerArgs {
    #[command(flatten)]
    pub link: ChildLink,

    #[arg(long)]
    pub server: String,

    #[arg(long, default_value_t = 15)]
    pub interval: u64,
}

#[derive(Debug, Clone, clap::Args)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub link: ChildLink,

    /// Position of the channel in the channel file (admin is 0)
    #[arg(long)]
    pub index: usize,

    #[arg(long)]
    pub channel: String,

    #[arg(long, allow_hyphen_values = true)]
    pub persona: String,

    #[arg(long, default_value_t = 30)]
    pub announce_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub persona: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub nick: String,
    pub user: String,
    pub realname: String,
}

/// Resolved supervisor configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub host: String,
    pub port: u16,
    pub identity: Identity,
    pub channels: Vec<ChannelSpec>,
    pub mute_file: PathBuf,
    pub admin_key: String,
    pub ping_interval: Duration,
    pub announce_interval: Duration,
    pub quit_message: String,
    pub log_file: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required argument <{0}>")]
    MissingArgument(&'static str),
    #[error("failed to read channel file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no valid channels found in {}", path.display())]
    NoChannels { path: PathBuf },
}

impl BotConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let host = cli.host.ok_or(ConfigError::MissingArgument("HOST"))?;
        let port = cli.port.ok_or(ConfigError::MissingArgument("PORT"))?;
        let channels = load_channels(&cli.channels_file)?;
        let identity = Identity {
            user: cli.user.unwrap_or_else(|| cli.nick.clone()),
            realname: cli.realname.unwrap_or_else(|| cli.nick.clone()),
            nick: cli.nick,
        };

        Ok(Self {
            host,
            port,
            identity,
            channels,
            mute_file: cli.mute_file,
            admin_key: cli.admin_key,
            ping_interval: Duration::from_secs(cli.ping_interval),
            announce_interval: Duration::from_secs(cli.announce_interval),
            quit_message: cli.quit_message,
            log_file: cli.log_file,
        })
    }

    pub fn admin_channel(&self) -> &ChannelSpec {
        &self.channels[0]
    }
}

pub fn load_channels(path: &Path) -> Result<Vec<ChannelSpec>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let channels = parse_channels(&text);
    if channels.is_empty() {
        return Err(ConfigError::NoChannels {
            path: path.to_path_buf(),
        });
    }
    tracing::info!(
        total = channels.len(),
        admin = %channels[0].name,
        workers = channels.len() - 1,
        "loaded channels"
    );
    Ok(channels)
}

/// One entry per line: `#channel` or `#channel;persona`. The first entry is
/// the admin channel.
pub fn parse_channels(text: &str) -> Vec<ChannelSpec> {
    let mut channels = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if !line.starts_with('#') {
            continue;
        }
        let (name, persona) = match line.split_once(';') {
            Some((name, persona)) => (name, Some(persona)),
            None => (line, None),
        };
        if name.len() >= MAX_CHANNEL_NAME_LEN
            || persona.is_some_and(|p| p.len() >= MAX_PERSONA_LEN)
        {
            tracing::warn!(line = %line, "skipping channel entry: name or persona too long");
            continue;
        }
        let persona = persona
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PERSONA);
        channels.push(ChannelSpec {
            name: name.to_string(),
            persona: persona.to_string(),
        });
    }
    channels
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;

    use super::{load_channels, parse_channels, BotConfig, Cli, ConfigError, RoleCommand, DEFAULT_PERSONA};

    #[test]
    fn supervisor_defaults() {
        let cli = Cli::parse_from(["irc-relay-bot", "irc.example.net", "6667"]);
        assert!(cli.role.is_none());
        assert_eq!(cli.host.as_deref(), Some("irc.example.net"));
        assert_eq!(cli.port, Some(6667));
        assert_eq!(cli.nick, "bdoke1272");
        assert_eq!(cli.ping_interval, 15);
        assert_eq!(cli.announce_interval, 30);
        assert_eq!(cli.mute_file.to_str(), Some("muted_users.txt"));
        assert_eq!(cli.log_file.to_str(), Some("irc_chat.log"));
    }

    #[test]
    fn missing_positionals_is_a_usage_error() {
        let err = Cli::try_parse_from(["irc-relay-bot", "irc.example.net"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
        assert_ne!(err.exit_code(), 0);
    }

    #[test]
    fn worker_role_parses_without_positionals() {
        let cli = Cli::parse_from([
            "irc-relay-bot",
            "worker",
            "--socket-fd",
            "7",
            "--gate",
            "/tmp/gate.lock",
            "--index",
            "2",
            "--channel",
            "#rust",
            "--persona",
            "-grumpy- assistant",
        ]);
        match cli.role {
            Some(RoleCommand::Worker(args)) => {
                assert_eq!(args.link.socket_fd, 7);
                assert_eq!(args.index, 2);
                assert_eq!(args.channel, "#rust");
                assert_eq!(args.persona, "-grumpy- assistant");
                assert_eq!(args.announce_interval, 30);
            }
            other => panic!("expected worker role, got {other:?}"),
        }
    }

    #[test]
    fn parses_personas_and_defaults() {
        let channels = parse_channels("#admin\n#grumpy;You are grumpy.\r\nnot a channel\n#plain;\n");
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[0].name, "#admin");
        assert_eq!(channels[0].persona, DEFAULT_PERSONA);
        assert_eq!(channels[1].persona, "You are grumpy.");
        assert_eq!(channels[2].name, "#plain");
        assert_eq!(channels[2].persona, DEFAULT_PERSONA);
    }

    #[test]
    fn skips_overlong_entries() {
        let long_name = format!("#{}", "a".repeat(70));
        let long_persona = format!("#ok;{}", "p".repeat(300));
        let channels = parse_channels(&format!("{long_name}\n{long_persona}\n#fine\n"));
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "#fine");
    }

    #[test]
    fn empty_channel_file_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no channels here").unwrap();
        let err = load_channels(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NoChannels { .. }));
    }

    #[test]
    fn from_cli_resolves_identity_and_channels() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#admin\n#one;Be brief.").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::parse_from([
            "irc-relay-bot",
            "localhost",
            "6667",
            "--nick",
            "relaybot",
            "--channels-file",
            &path,
        ]);
        let config = BotConfig::from_cli(cli).unwrap();
        assert_eq!(config.identity.user, "relaybot");
        assert_eq!(config.identity.realname, "relaybot");
        assert_eq!(config.admin_channel().name, "#admin");
        assert_eq!(config.channels[1].persona, "Be brief.");
    }
}
