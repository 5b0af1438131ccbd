//! Session event log.
//!
//! Every entry is emitted through `tracing` and also kept in a bounded
//! per-session ring buffer so it can be replayed to users who join later.

use std::collections::VecDeque;
use std::net::IpAddr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use tandem_wire::ParticipantId;

/// Severity. Ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Join,
    Leave,
    Kick,
    Ban,
    Unban,
    Op,
    Deop,
    Trust,
    Untrust,
    Mute,
    Unmute,
    Status,
    RuleBreak,
    PubList,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "Join",
            Self::Leave => "Leave",
            Self::Kick => "Kick",
            Self::Ban => "Ban",
            Self::Unban => "Unban",
            Self::Op => "Op",
            Self::Deop => "Deop",
            Self::Trust => "Trust",
            Self::Untrust => "Untrust",
            Self::Mute => "Mute",
            Self::Unmute => "Unmute",
            Self::Status => "Status",
            Self::RuleBreak => "RuleBreak",
            Self::PubList => "PubList",
        }
    }
}

/// The user an entry is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogUser {
    pub id: ParticipantId,
    pub ip: Option<IpAddr>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub topic: Topic,
    pub session: String,
    pub user: Option<LogUser>,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: Level, topic: Topic, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            topic,
            session: String::new(),
            user: None,
            message: message.into(),
        }
    }

    pub fn about(mut self, id: ParticipantId, ip: Option<IpAddr>, name: &str) -> Self {
        self.user = Some(LogUser {
            id,
            ip,
            name: name.to_string(),
        });
        self
    }

    /// `id;name`, or `id;ip;name` when private data is included.
    pub fn user_label(&self, include_private: bool) -> String {
        match &self.user {
            None => String::new(),
            Some(u) => match u.ip {
                Some(ip) if include_private => format!("{};{};{}", u.id, ip, u.name),
                _ => format!("{};{}", u.id, u.name),
            },
        }
    }

    /// JSON fields of a `log` reply. The session id is always omitted.
    pub fn to_json(&self, include_private: bool) -> Map<String, Value> {
        let mut o = Map::new();
        o.insert(
            "timestamp".into(),
            json!(self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        o.insert("level".into(), json!(self.level.as_str()));
        o.insert("topic".into(), json!(self.topic.as_str()));
        if self.user.is_some() {
            o.insert("user".into(), json!(self.user_label(include_private)));
        }
        o
    }
}

/// Bounded ring buffer of log entries, oldest first.
#[derive(Debug, Clone)]
pub struct SessionLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl SessionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Entries at `level` or more severe, oldest first.
    pub fn at_least(&self, level: Level) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.level <= level)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Warn < Level::Info);
        assert!(Level::Info < Level::Debug);
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let mut log = SessionLog::new(2);
        log.push(LogEntry::new(Level::Info, Topic::Join, "a"));
        log.push(LogEntry::new(Level::Info, Topic::Join, "b"));
        log.push(LogEntry::new(Level::Info, Topic::Join, "c"));

        let messages: Vec<_> = log.at_least(Level::Debug).map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["b", "c"]);
    }

    #[test]
    fn test_at_least_filters_debug() {
        let mut log = SessionLog::new(10);
        log.push(LogEntry::new(Level::Debug, Topic::Status, "noise"));
        log.push(LogEntry::new(Level::Warn, Topic::RuleBreak, "bad"));
        log.push(LogEntry::new(Level::Info, Topic::Join, "hi"));

        let messages: Vec<_> = log.at_least(Level::Info).map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["bad", "hi"]);
    }

    /// The address is only included when asked for.
    #[test]
    fn test_json_strips_private_data() {
        let entry = LogEntry::new(Level::Info, Topic::Kick, "Kicked by bob").about(
            3,
            Some("10.1.2.3".parse().unwrap()),
            "alice",
        );

        assert_eq!(entry.to_json(false)["user"], "3;alice");
        assert_eq!(entry.to_json(true)["user"], "3;10.1.2.3;alice");
        assert_eq!(entry.to_json(false)["topic"], "Kick");
        assert!(entry.to_json(false).get("session").is_none());
    }
}
