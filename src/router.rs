//! Decides what the supervisor does with each line the server sends.
//!
//! Routing is pure with respect to I/O: [`Router::route`] returns the
//! [`Action`]s to perform, and the supervisor executes them in order. The only
//! side effect is the mute list, which is persisted as it changes.

use std::time::Duration;

use crate::{
    irc::{is_other_bot_nick, ping_token, privmsg, IrcLine},
    mute::{is_valid_nick, MuteSet},
    pipe::PipeMessage,
    registry::ProcessRegistry,
};

const STATUS_PACING: Duration = Duration::from_millis(100);
const NAMES_PACING: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write one line to the server.
    Send(String),
    /// Wait before the next action.
    Pause(Duration),
    /// Hand a message to the worker for channel `worker`.
    Forward { worker: usize, message: PipeMessage },
}

#[derive(Debug)]
pub struct Router {
    nick: String,
    admin_channel: String,
    mutes: MuteSet,
}

impl Router {
    pub fn new(nick: impl Into<String>, admin_channel: impl Into<String>, mutes: MuteSet) -> Self {
        Self {
            nick: nick.into(),
            admin_channel: admin_channel.into(),
            mutes,
        }
    }

    pub fn mutes(&self) -> &MuteSet {
        &self.mutes
    }

    pub fn route(&mut self, line: &str, registry: &ProcessRegistry) -> Vec<Action> {
        if let Some(token) = ping_token(line) {
            return vec![Action::Send(format!("PONG :{token}"))];
        }

        let Some(parsed) = IrcLine::parse(line) else {
            tracing::debug!(line = %line, "ignoring unparseable line");
            return Vec::new();
        };

        match parsed.command {
            "353" => self.names_reply(&parsed),
            "PRIVMSG" => self.privmsg(&parsed, registry),
            _ => Vec::new(),
        }
    }

    fn names_reply(&self, line: &IrcLine<'_>) -> Vec<Action> {
        // <me> <type> <channel> :<names>
        let (Some(channel), Some(names)) = (line.params.get(2), line.trailing) else {
            tracing::debug!(params = ?line.params, "malformed names reply");
            return Vec::new();
        };
        vec![self.admin_notice(&format!("Users in {channel}: {names}"))]
    }

    fn privmsg(&mut self, line: &IrcLine<'_>, registry: &ProcessRegistry) -> Vec<Action> {
        let (Some(sender), Some(target), Some(text)) =
            (line.nick(), line.params.first().copied(), line.trailing)
        else {
            return Vec::new();
        };
        tracing::info!(target: "irc_relay_bot::chat", channel = %target, sender = %sender, text = %text, "message");

        if self.mutes.contains(sender) {
            tracing::info!(sender = %sender, channel = %target, "ignoring message from muted user");
            return Vec::new();
        }
        if is_other_bot_nick(sender) {
            tracing::info!(sender = %sender, "ignoring message from other bot");
            return Vec::new();
        }

        if target.eq_ignore_ascii_case(&self.nick) {
            tracing::info!(sender = %sender, "direct message");
            return vec![Action::Send(privmsg(
                sender,
                "I'm a channel bot, please talk to me in my channels!",
            ))];
        }

        if target.eq_ignore_ascii_case(&self.admin_channel) {
            return self.admin_command(sender, text, registry);
        }

        match registry.worker_for_channel(target) {
            Some(worker) if worker.pipe_open() => {
                channel_command(sender, text, worker.index, target, &worker.channel.persona, &self.admin_channel)
            }
            Some(_) => {
                tracing::debug!(channel = %target, "worker pipe closed, dropping message");
                Vec::new()
            }
            None => {
                tracing::debug!(channel = %target, "message for unmanaged channel");
                Vec::new()
            }
        }
    }

    fn admin_command(&mut self, sender: &str, text: &str, registry: &ProcessRegistry) -> Vec<Action> {
        let Some((name, rest)) = split_command(text) else {
            return Vec::new();
        };
        tracing::info!(sender = %sender, command = name, "admin command");

        match (name, rest) {
            ("mute", nick) => {
                let nick = nick.unwrap_or_default();
                if !is_valid_nick(nick) {
                    return vec![self.admin_notice("Invalid nick for !mute command.")];
                }
                let reply = match self.mutes.add(nick) {
                    Ok(_) => format!("User {nick} has been globally muted."),
                    Err(error) => {
                        tracing::warn!(nick = %nick, error = %error, "mute failed");
                        format!("Failed to mute user {nick}.")
                    }
                };
                vec![self.admin_notice(&reply)]
            }
            ("unmute", nick) => {
                let nick = nick.unwrap_or_default();
                if !is_valid_nick(nick) {
                    return vec![self.admin_notice("Invalid nick for !unmute command.")];
                }
                let reply = match self.mutes.remove(nick) {
                    Ok(true) => format!("User {nick} has been unmuted."),
                    Ok(false) => format!("User {nick} was not found in mute list or failed to unmute."),
                    Err(error) => {
                        tracing::warn!(nick = %nick, error = %error, "unmute failed");
                        format!("User {nick} was not found in mute list or failed to unmute.")
                    }
                };
                vec![self.admin_notice(&reply)]
            }
            ("ask", None | Some("")) => vec![self.admin_notice("Usage: !ask <your question>")],
            ("ask", Some(_)) => vec![self.admin_notice("The !ask command is for use in my other managed channels.")],
            ("status", None) => self.status_report(registry),
            ("users", None) => {
                let mut actions = vec![self.admin_notice("Requesting user lists for all managed channels...")];
                for worker in registry.workers() {
                    actions.push(Action::Send(format!("NAMES {}", worker.channel.name)));
                    actions.push(Action::Pause(NAMES_PACING));
                }
                actions
            }
            _ => Vec::new(),
        }
    }

    fn status_report(&self, registry: &ProcessRegistry) -> Vec<Action> {
        let mut actions = vec![self.admin_notice("--- Bot Status ---")];
        for worker in registry.workers() {
            let line = match worker.process.active_pid() {
                Some(pid) => format!("Worker for {} (PID {pid}) is ACTIVE.", worker.channel.name),
                None => format!("Worker for {} is INACTIVE/TERMINATED.", worker.channel.name),
            };
            actions.push(self.admin_notice(&line));
            actions.push(Action::Pause(STATUS_PACING));
        }
        let pinger = match registry.pinger().active_pid() {
            Some(pid) => format!("Pinger (PID {pid}) is ACTIVE."),
            None => "Pinger is INACTIVE/TERMINATED.".to_string(),
        };
        actions.push(self.admin_notice(&pinger));
        actions.push(self.admin_notice("--- End Status ---"));
        actions
    }

    fn admin_notice(&self, text: &str) -> Action {
        Action::Send(privmsg(&self.admin_channel, text))
    }
}

fn channel_command(
    sender: &str,
    text: &str,
    worker: usize,
    channel: &str,
    persona: &str,
    admin_channel: &str,
) -> Vec<Action> {
    match split_command(text) {
        Some(("ask", None | Some(""))) => vec![Action::Send(privmsg(channel, "Usage: !ask <your question>"))],
        Some(("ask", Some(prompt))) => {
            tracing::info!(sender = %sender, channel = %channel, "forwarding !ask to worker");
            vec![Action::Forward {
                worker,
                message: PipeMessage::Ask {
                    sender: sender.to_string(),
                    persona: persona.to_string(),
                    prompt: prompt.to_string(),
                },
            }]
        }
        Some(("hello", None)) => vec![Action::Forward {
            worker,
            message: PipeMessage::Hello {
                sender: sender.to_string(),
                text: text.to_string(),
            },
        }],
        Some(("status", None)) => vec![Action::Send(privmsg(
            channel,
            &format!("Hi {sender}! I'm worker for this channel. For detailed bot status, ask in {admin_channel}"),
        ))],
        _ => Vec::new(),
    }
}

/// `!name` → `(name, None)` and `!name rest` → `(name, Some(rest))` with
/// `rest` trimmed. Commands without arguments only match the bare form.
fn split_command(text: &str) -> Option<(&str, Option<&str>)> {
    let body = text.strip_prefix('!')?;
    Some(match body.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, Some(rest.trim())),
        None => (body, None),
    })
}
