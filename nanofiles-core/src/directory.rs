//! Directory state: registered nicknames, serving peers and the published-file table.
//!
//! Host-driven like the rest of this crate: the service loop passes each decoded
//! request to [`DirectoryState::handle`] and sends back whatever response it returns.
//! Every mutation goes through one of the intention-revealing operations below, so the
//! ownership invariant (every published file belongs to a serving peer) holds after
//! each request.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::SystemTime;

use crate::catalog::FileInfo;
use crate::dir_message::{DirMessage, UserEntry};

/// A published file and the serving peer that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFile {
    pub info: FileInfo,
    pub owner: String,
}

/// Why a nickname cannot be registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NicknameError {
    #[error("nickname is empty")]
    Empty,
    #[error("nickname contains ':'")]
    ContainsColon,
    #[error("nickname contains whitespace")]
    ContainsWhitespace,
}

/// Check a nickname before it goes on the wire or into the registry.
/// `:` would clash with `ip:port` peer targets; whitespace with the serving marker.
pub fn validate_nickname(nick: &str) -> Result<(), NicknameError> {
    if nick.is_empty() {
        return Err(NicknameError::Empty);
    }
    if nick.contains(':') {
        return Err(NicknameError::ContainsColon);
    }
    if nick.chars().any(char::is_whitespace) {
        return Err(NicknameError::ContainsWhitespace);
    }
    Ok(())
}

/// Aggregate of the directory's maps. Owned by exactly one service loop.
#[derive(Debug, Default)]
pub struct DirectoryState {
    nicks: HashMap<String, SystemTime>,
    servers: HashMap<String, SocketAddr>,
    files: HashMap<String, PublishedFile>,
}

impl DirectoryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one request from `from`. Returns the response to send, or `None` for
    /// messages that are not directory requests (responses echoed at the directory).
    pub fn handle(&mut self, request: DirMessage, from: SocketAddr) -> Option<DirMessage> {
        let response = match request {
            DirMessage::Login => DirMessage::LoginOk {
                servers: u32::try_from(self.servers.len()).unwrap_or(u32::MAX),
            },
            DirMessage::Register { nick } => {
                if self.register(&nick) {
                    DirMessage::RegisterOk
                } else {
                    DirMessage::RegisterFail
                }
            }
            DirMessage::GetUsers => DirMessage::UserList {
                users: self.users(),
            },
            DirMessage::ServeFiles { nick, port, files } => {
                self.publish(&nick, SocketAddr::new(from.ip(), port), files);
                DirMessage::ServeFilesOk
            }
            DirMessage::Lookup { nick } => match self.lookup(&nick) {
                Some(addr) => DirMessage::LookupFound { addr },
                None => DirMessage::LookupNotFound,
            },
            DirMessage::Logoff { nick } => {
                self.logoff(&nick);
                DirMessage::Quit
            }
            DirMessage::StopServing { nick } => {
                self.unpublish(&nick);
                DirMessage::StopServingOk
            }
            DirMessage::GetFiles => DirMessage::FileList {
                files: self.files(),
            },
            DirMessage::LoginOk { .. }
            | DirMessage::RegisterOk
            | DirMessage::RegisterFail
            | DirMessage::UserList { .. }
            | DirMessage::ServeFilesOk
            | DirMessage::LookupFound { .. }
            | DirMessage::LookupNotFound
            | DirMessage::Quit
            | DirMessage::StopServingOk
            | DirMessage::FileList { .. } => return None,
        };
        Some(response)
    }

    /// Register a nickname. Duplicates and invalid nicknames are rejected, never overwritten.
    pub fn register(&mut self, nick: &str) -> bool {
        if validate_nickname(nick).is_err() || self.nicks.contains_key(nick) {
            return false;
        }
        self.nicks.insert(nick.to_string(), SystemTime::now());
        true
    }

    /// Remove a registration. The nickname need not be serving; its serving record,
    /// if any, is left to STOP_SERVING.
    pub fn logoff(&mut self, nick: &str) -> bool {
        self.nicks.remove(nick).is_some()
    }

    pub fn registered_at(&self, nick: &str) -> Option<SystemTime> {
        self.nicks.get(nick).copied()
    }

    /// All registered nicknames, sorted, with serving peers flagged.
    pub fn users(&self) -> Vec<UserEntry> {
        let mut users: Vec<UserEntry> = self
            .nicks
            .keys()
            .map(|nick| UserEntry {
                nick: nick.clone(),
                serving: self.servers.contains_key(nick),
            })
            .collect();
        users.sort_by(|a, b| a.nick.cmp(&b.nick));
        users
    }

    /// Record `nick` as serving at `addr` and publish its files. A hash already
    /// published by anyone is overwritten: last publisher wins.
    pub fn publish(&mut self, nick: &str, addr: SocketAddr, files: Vec<FileInfo>) {
        self.servers.insert(nick.to_string(), addr);
        for info in files {
            self.files.insert(
                info.hash.clone(),
                PublishedFile {
                    info,
                    owner: nick.to_string(),
                },
            );
        }
    }

    /// Stop serving: drop the serving record and every file it owns.
    /// Returns how many file records were purged.
    pub fn unpublish(&mut self, nick: &str) -> usize {
        self.servers.remove(nick);
        let before = self.files.len();
        self.files.retain(|_, f| f.owner != nick);
        before - self.files.len()
    }

    pub fn lookup(&self, nick: &str) -> Option<SocketAddr> {
        self.servers.get(nick).copied()
    }

    pub fn serving_count(&self) -> usize {
        self.servers.len()
    }

    /// All published files across owners, sorted by name then hash.
    pub fn files(&self) -> Vec<FileInfo> {
        let mut files: Vec<FileInfo> = self.files.values().map(|f| f.info.clone()).collect();
        files.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.hash.cmp(&b.hash)));
        files
    }

    pub fn owner_of(&self, hash: &str) -> Option<&str> {
        self.files.get(hash).map(|f| f.owner.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SocketAddr {
        "10.0.0.7:53124".parse().unwrap()
    }

    fn three_files() -> Vec<FileInfo> {
        vec![
            FileInfo::new("a.txt", "aaa1", 1),
            FileInfo::new("b.txt", "bbb2", 2),
            FileInfo::new("c.txt", "ccc3", 3),
        ]
    }

    #[test]
    fn register_twice_then_after_logoff() {
        let mut dir = DirectoryState::new();
        let reg = || DirMessage::Register {
            nick: "alice".into(),
        };
        assert_eq!(dir.handle(reg(), client()), Some(DirMessage::RegisterOk));
        assert!(dir.registered_at("alice").is_some());
        assert_eq!(dir.handle(reg(), client()), Some(DirMessage::RegisterFail));
        assert_eq!(
            dir.handle(
                DirMessage::Logoff {
                    nick: "alice".into()
                },
                client()
            ),
            Some(DirMessage::Quit)
        );
        assert_eq!(dir.handle(reg(), client()), Some(DirMessage::RegisterOk));
    }

    #[test]
    fn invalid_nicknames_fail() {
        let mut dir = DirectoryState::new();
        for nick in ["", "a:b", "has space", "tab\tbed"] {
            assert!(!dir.register(nick), "{:?} should be rejected", nick);
        }
        assert!(dir.users().is_empty());
    }

    #[test]
    fn logoff_of_unknown_nick_still_acks() {
        let mut dir = DirectoryState::new();
        assert_eq!(
            dir.handle(DirMessage::Logoff { nick: "ghost".into() }, client()),
            Some(DirMessage::Quit)
        );
    }

    #[test]
    fn serve_then_stop_purges_files_and_lookup() {
        let mut dir = DirectoryState::new();
        dir.register("alice");
        let resp = dir.handle(
            DirMessage::ServeFiles {
                nick: "alice".into(),
                port: 10_000,
                files: three_files(),
            },
            client(),
        );
        assert_eq!(resp, Some(DirMessage::ServeFilesOk));
        assert_eq!(dir.files().len(), 3);
        assert_eq!(
            dir.handle(DirMessage::Lookup { nick: "alice".into() }, client()),
            Some(DirMessage::LookupFound {
                addr: "10.0.0.7:10000".parse().unwrap()
            })
        );
        assert_eq!(
            dir.handle(DirMessage::Login, client()),
            Some(DirMessage::LoginOk { servers: 1 })
        );

        assert_eq!(
            dir.handle(
                DirMessage::StopServing {
                    nick: "alice".into()
                },
                client()
            ),
            Some(DirMessage::StopServingOk)
        );
        assert_eq!(
            dir.handle(DirMessage::GetFiles, client()),
            Some(DirMessage::FileList { files: vec![] })
        );
        assert_eq!(
            dir.handle(DirMessage::Lookup { nick: "alice".into() }, client()),
            Some(DirMessage::LookupNotFound)
        );
        assert!(dir.registered_at("alice").is_some());
    }

    #[test]
    fn stop_serving_keeps_other_owners_files() {
        let mut dir = DirectoryState::new();
        dir.publish("alice", client(), three_files());
        dir.publish("bob", client(), vec![FileInfo::new("d.txt", "ddd4", 4)]);
        assert_eq!(dir.unpublish("alice"), 3);
        assert_eq!(dir.files(), vec![FileInfo::new("d.txt", "ddd4", 4)]);
        assert_eq!(dir.owner_of("ddd4"), Some("bob"));
    }

    #[test]
    fn same_hash_last_publisher_wins() {
        let mut dir = DirectoryState::new();
        dir.publish("alice", client(), vec![FileInfo::new("x.bin", "dup", 9)]);
        dir.publish("bob", client(), vec![FileInfo::new("y.bin", "dup", 9)]);
        assert_eq!(dir.owner_of("dup"), Some("bob"));
        assert_eq!(dir.files(), vec![FileInfo::new("y.bin", "dup", 9)]);
        // alice no longer owns it, so stopping alice leaves it published
        assert_eq!(dir.unpublish("alice"), 0);
        assert_eq!(dir.files().len(), 1);
    }

    #[test]
    fn user_list_flags_serving_peers() {
        let mut dir = DirectoryState::new();
        dir.register("bob");
        dir.register("alice");
        dir.publish("alice", client(), vec![]);
        assert_eq!(
            dir.handle(DirMessage::GetUsers, client()),
            Some(DirMessage::UserList {
                users: vec![
                    UserEntry {
                        nick: "alice".into(),
                        serving: true
                    },
                    UserEntry {
                        nick: "bob".into(),
                        serving: false
                    },
                ]
            })
        );
    }

    #[test]
    fn responses_sent_to_directory_are_ignored() {
        let mut dir = DirectoryState::new();
        assert_eq!(dir.handle(DirMessage::RegisterOk, client()), None);
        assert_eq!(dir.handle(DirMessage::FileList { files: vec![] }, client()), None);
        assert_eq!(dir.serving_count(), 0);
    }
}
