//! Minimal IRC line model: enough to route what the bot reacts to.

use std::sync::LazyLock;

use regex::Regex;

/// Nicks of the other automated bots on the network: `b`, four letters, four
/// digits.
static OTHER_BOT_NICK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^b[A-Za-z]{4}[0-9]{4}$").expect("valid regex"));

/// Outbound lines that carry a channel key.
static CHANNEL_KEY: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)^(JOIN\s+\S+\s+)(\S+)").expect("valid regex"),
        Regex::new(r"(?i)^(MODE\s+\S+\s+[+-]k\s+)(\S+)").expect("valid regex"),
    ]
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine<'a> {
    pub prefix: Option<&'a str>,
    pub command: &'a str,
    pub params: Vec<&'a str>,
    pub trailing: Option<&'a str>,
}

impl<'a> IrcLine<'a> {
    pub fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (prefix, rest) = match line.strip_prefix(':') {
            Some(stripped) => {
                let (prefix, rest) = stripped.split_once(' ')?;
                (Some(prefix), rest)
            }
            None => (None, line),
        };

        let (head, trailing) = match rest.find(" :") {
            Some(at) => (&rest[..at], Some(&rest[at + 2..])),
            None => match rest.strip_prefix(':') {
                Some(trailing) => ("", Some(trailing)),
                None => (rest, None),
            },
        };

        let mut words = head.split(' ').filter(|word| !word.is_empty());
        let command = words.next()?;
        Some(Self {
            prefix,
            command,
            params: words.collect(),
            trailing,
        })
    }

    /// Nick part of the prefix (`nick!user@host` → `nick`).
    pub fn nick(&self) -> Option<&'a str> {
        let prefix = self.prefix?;
        let nick = prefix.split('!').next().unwrap_or(prefix);
        (!nick.is_empty()).then_some(nick)
    }
}

/// Token of a server keep-alive probe (`PING :token`).
pub fn ping_token(line: &str) -> Option<&str> {
    line.strip_prefix("PING :")
}

pub fn is_other_bot_nick(nick: &str) -> bool {
    OTHER_BOT_NICK.is_match(nick)
}

pub fn privmsg(target: &str, text: &str) -> String {
    format!("PRIVMSG {target} :{text}")
}

/// Mask channel keys before a line is logged.
pub fn redact_keys(line: &str) -> String {
    let mut output = line.to_string();
    for pattern in CHANNEL_KEY.iter() {
        output = pattern
            .replace(&output, |caps: &regex::Captures| format!("{}[REDACTED]", &caps[1]))
            .into_owned();
    }
    output
}

#[cfg(test)]
mod tests {
    use super::{is_other_bot_nick, ping_token, privmsg, redact_keys, IrcLine};

    #[test]
    fn channel_keys_are_redacted() {
        assert_eq!(redact_keys("JOIN #admin hunter2"), "JOIN #admin [REDACTED]");
        assert_eq!(redact_keys("MODE #admin +k hunter2"), "MODE #admin +k [REDACTED]");
        assert_eq!(redact_keys("JOIN #rust"), "JOIN #rust");
        assert_eq!(redact_keys("PRIVMSG #rust :JOIN #admin key"), "PRIVMSG #rust :JOIN #admin key");
    }

    #[test]
    fn parses_privmsg() {
        let line = IrcLine::parse(":alice!a@host PRIVMSG #rust :!ask what: now?").unwrap();
        assert_eq!(line.nick(), Some("alice"));
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.params, vec!["#rust"]);
        assert_eq!(line.trailing, Some("!ask what: now?"));
    }

    #[test]
    fn parses_names_reply() {
        let line = IrcLine::parse(":irc.test 353 bot = #rust :@alice bob carol").unwrap();
        assert_eq!(line.command, "353");
        assert_eq!(line.params, vec!["bot", "=", "#rust"]);
        assert_eq!(line.trailing, Some("@alice bob carol"));
    }

    #[test]
    fn parses_prefixless_and_bare_lines() {
        let line = IrcLine::parse("PING :irc.test").unwrap();
        assert_eq!(line.prefix, None);
        assert_eq!(line.command, "PING");
        assert_eq!(line.trailing, Some("irc.test"));

        let line = IrcLine::parse(":irc.test 376 bot").unwrap();
        assert_eq!(line.command, "376");
        assert_eq!(line.trailing, None);

        assert!(IrcLine::parse(":only-prefix").is_none());
        assert!(IrcLine::parse("").is_none());
    }

    #[test]
    fn server_prefix_has_nick_like_name() {
        let line = IrcLine::parse(":irc.test NOTICE * :hi").unwrap();
        assert_eq!(line.nick(), Some("irc.test"));
    }

    #[test]
    fn ping_token_requires_exact_shape() {
        assert_eq!(ping_token("PING :irc.test"), Some("irc.test"));
        assert_eq!(ping_token(":x PING :y"), None);
        assert_eq!(ping_token("PING irc.test"), None);
    }

    #[test]
    fn recognises_other_bots() {
        assert!(is_other_bot_nick("bdoke1272"));
        assert!(is_other_bot_nick("bABCD0000"));
        assert!(!is_other_bot_nick("adoke1272"));
        assert!(!is_other_bot_nick("bdoke127"));
        assert!(!is_other_bot_nick("bdo3e1272"));
        assert!(!is_other_bot_nick("alice"));
    }

    #[test]
    fn formats_privmsg() {
        assert_eq!(privmsg("#c", "hi there"), "PRIVMSG #c :hi there");
    }
}
