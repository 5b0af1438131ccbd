//! Session-local ban list.
//!
//! Bans are enacted by session operators, usually together with a kick.
//! Addresses are only revealed to privileged viewers.

use std::net::IpAddr;

use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub id: u32,
    pub username: String,
    pub ext_auth_id: String,
    pub ip: Option<IpAddr>,
    pub banned_by: String,
}

#[derive(Debug, Clone)]
pub struct BanList {
    entries: Vec<BanEntry>,
    next_id: u32,
}

impl Default for BanList {
    fn default() -> Self {
        Self::new()
    }
}

impl BanList {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Add a ban entry.
    ///
    /// Returns the id of the new entry, or 0 if the address or ext-auth id is
    /// already banned. A nonzero `explicit_id` is used as-is (restoring a
    /// persisted list).
    pub fn add_ban(
        &mut self,
        username: &str,
        ip: Option<IpAddr>,
        ext_auth_id: &str,
        banned_by: &str,
        explicit_id: u32,
    ) -> u32 {
        if self.is_banned(ip, ext_auth_id) {
            return 0;
        }

        let id = if explicit_id > 0 {
            self.next_id = self.next_id.max(explicit_id + 1);
            explicit_id
        } else {
            let id = self.next_id;
            self.next_id += 1;
            id
        };

        self.entries.push(BanEntry {
            id,
            username: username.to_string(),
            ext_auth_id: ext_auth_id.to_string(),
            ip,
            banned_by: banned_by.to_string(),
        });
        id
    }

    /// Remove a ban entry, returning the banned username.
    pub fn remove_ban(&mut self, id: u32) -> Option<String> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos).username)
    }

    /// True if either the address or the ext-auth id matches an entry.
    pub fn is_banned(&self, ip: Option<IpAddr>, ext_auth_id: &str) -> bool {
        self.entries.iter().any(|e| {
            (ip.is_some() && e.ip == ip) || (!ext_auth_id.is_empty() && e.ext_auth_id == ext_auth_id)
        })
    }

    pub fn entries(&self) -> &[BanEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON array of `{id, username, bannedBy, ip?}`.
    pub fn to_json(&self, show_ip: bool) -> Value {
        Value::Array(
            self.entries
                .iter()
                .map(|e| {
                    let mut o = json!({
                        "id": e.id,
                        "username": e.username,
                        "bannedBy": e.banned_by,
                    });
                    if show_ip && let Some(ip) = e.ip {
                        o["ip"] = Value::String(ip.to_string());
                    }
                    o
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn test_duplicate_ban_is_noop() {
        let mut bans = BanList::new();
        let first = bans.add_ban("troll", addr("10.0.0.5"), "ext-1", "op", 0);
        let second = bans.add_ban("troll", addr("10.0.0.5"), "ext-1", "op", 0);

        assert!(first > 0);
        assert_eq!(second, 0);
        assert_eq!(bans.entries().len(), 1);
    }

    #[test]
    fn test_is_banned_either_signal() {
        let mut bans = BanList::new();
        bans.add_ban("troll", addr("10.0.0.5"), "ext-1", "op", 0);

        assert!(bans.is_banned(addr("10.0.0.5"), ""));
        assert!(bans.is_banned(None, "ext-1"));
        assert!(bans.is_banned(addr("192.168.1.1"), "ext-1"));
        assert!(!bans.is_banned(addr("192.168.1.1"), "ext-2"));
        assert!(!bans.is_banned(None, ""));
    }

    #[test]
    fn test_empty_ext_auth_never_matches() {
        let mut bans = BanList::new();
        bans.add_ban("guest", addr("10.0.0.9"), "", "op", 0);
        assert!(!bans.is_banned(addr("10.0.0.10"), ""));
    }

    #[test]
    fn test_remove_ban() {
        let mut bans = BanList::new();
        let id = bans.add_ban("troll", addr("10.0.0.5"), "", "op", 0);

        assert_eq!(bans.remove_ban(id).as_deref(), Some("troll"));
        assert_eq!(bans.remove_ban(id), None);
        assert!(!bans.is_banned(addr("10.0.0.5"), ""));
    }

    #[test]
    fn test_explicit_id_advances_counter() {
        let mut bans = BanList::new();
        assert_eq!(bans.add_ban("a", addr("10.0.0.1"), "", "op", 10), 10);
        assert_eq!(bans.add_ban("b", addr("10.0.0.2"), "", "op", 0), 11);
    }

    #[test]
    fn test_json_hides_ip_by_default() {
        let mut bans = BanList::new();
        bans.add_ban("troll", addr("10.0.0.5"), "", "alice", 0);

        let public = bans.to_json(false);
        assert_eq!(public[0]["username"], "troll");
        assert_eq!(public[0]["bannedBy"], "alice");
        assert!(public[0].get("ip").is_none());

        let private = bans.to_json(true);
        assert_eq!(private[0]["ip"], "10.0.0.5");
    }
}
