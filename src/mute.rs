//! Globally muted nicks, persisted one per line and rewritten in full on every
//! change.

use std::{
    collections::BTreeSet,
    io::ErrorKind,
    path::{Path, PathBuf},
};

pub const MAX_NICK_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum MuteError {
    #[error("invalid nick '{0}'")]
    InvalidNick(String),
    #[error("failed to read mute list {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to save mute list {}: {source}", path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct MuteSet {
    path: PathBuf,
    nicks: BTreeSet<String>,
}

pub fn is_valid_nick(nick: &str) -> bool {
    !nick.is_empty() && nick.len() < MAX_NICK_LEN && !nick.contains(char::is_whitespace)
}

impl MuteSet {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            nicks: BTreeSet::new(),
        }
    }

    /// A missing file is an empty set.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, MuteError> {
        let path = path.into();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "mute list not found, no users muted");
                return Ok(Self::empty(path));
            }
            Err(source) => return Err(MuteError::Load { path, source }),
        };

        let nicks: BTreeSet<String> = text
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| is_valid_nick(line))
            .map(ToOwned::to_owned)
            .collect();
        tracing::info!(path = %path.display(), count = nicks.len(), "loaded mute list");
        Ok(Self { path, nicks })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, nick: &str) -> bool {
        self.nicks.contains(nick)
    }

    /// Returns whether the nick was newly muted. The file is rewritten only on
    /// change.
    pub fn add(&mut self, nick: &str) -> Result<bool, MuteError> {
        if !is_valid_nick(nick) {
            return Err(MuteError::InvalidNick(nick.to_string()));
        }
        if !self.nicks.insert(nick.to_string()) {
            return Ok(false);
        }
        if let Err(error) = self.save() {
            self.nicks.remove(nick);
            return Err(error);
        }
        tracing::info!(nick = %nick, total = self.nicks.len(), "muted user");
        Ok(true)
    }

    /// Returns whether the nick was muted before.
    pub fn remove(&mut self, nick: &str) -> Result<bool, MuteError> {
        if !self.nicks.remove(nick) {
            return Ok(false);
        }
        if let Err(error) = self.save() {
            self.nicks.insert(nick.to_string());
            return Err(error);
        }
        tracing::info!(nick = %nick, total = self.nicks.len(), "unmuted user");
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.nicks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nicks.is_empty()
    }

    fn save(&self) -> Result<(), MuteError> {
        let mut body = String::new();
        for nick in &self.nicks {
            body.push_str(nick);
            body.push('\n');
        }
        std::fs::write(&self.path, body).map_err(|source| MuteError::Save {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{MuteError, MuteSet};

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let set = MuteSet::load(dir.path().join("muted.txt")).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn mute_survives_reload_and_unmute_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muted.txt");

        let mut set = MuteSet::load(&path).unwrap();
        assert!(set.add("X").unwrap());
        assert!(!set.add("X").unwrap());

        let reloaded = MuteSet::load(&path).unwrap();
        assert!(reloaded.contains("X"));
        assert_eq!(reloaded.len(), 1);

        let mut set = reloaded;
        assert!(set.remove("X").unwrap());
        assert!(!set.remove("X").unwrap());
        assert!(!MuteSet::load(&path).unwrap().contains("X"));
    }

    #[test]
    fn rejects_invalid_nicks() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = MuteSet::empty(dir.path().join("muted.txt"));
        assert!(matches!(set.add(""), Err(MuteError::InvalidNick(_))));
        assert!(matches!(set.add(&"n".repeat(40)), Err(MuteError::InvalidNick(_))));
        assert!(matches!(set.add("two words"), Err(MuteError::InvalidNick(_))));
        assert!(set.is_empty());
    }

    #[test]
    fn load_skips_blank_and_overlong_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muted.txt");
        std::fs::write(&path, format!("alice\r\n\n{}\nbob\n", "z".repeat(40))).unwrap();
        let set = MuteSet::load(&path).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("alice"));
        assert!(set.contains("bob"));
    }

    #[test]
    fn failed_save_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be written as a file.
        let mut set = MuteSet::empty(dir.path());
        assert!(matches!(set.add("carol"), Err(MuteError::Save { .. })));
        assert!(!set.contains("carol"));
    }
}
