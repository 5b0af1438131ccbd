//! Tandem Session History
//!
//! The history is the single ordered log of messages a session has accepted.
//! Every connection replays it from its own cursor, batch by batch, so a
//! newcomer reconstructs the canvas by receiving exactly what everyone else
//! received, in the same order.
//!
//! # Invariants
//!
//! - Appends are all-or-nothing: a message that would push the retained size
//!   past the size limit is rejected and nothing changes.
//! - Indices only grow. A reset replaces the retained window but the new
//!   window starts where the old one ended, so stale cursors always land
//!   before the new content.
//! - Nothing is ever dropped while retained. Batches every consumer has read
//!   are moved to a [`SpillStore`] and decoded again on demand.
//!
//! The store also carries the persistent session attributes (title, password
//! hashes, flags, limits), the participant id queue, the ban list and the
//! authenticated op/trust grants, since all of these live and die with the
//! session's history.

#![deny(unsafe_code)]

pub mod ban;
pub mod id_queue;
pub mod spill;

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use prost::Message;
use tandem_wire::Envelope;
use thiserror::Error;
use tracing::warn;

pub use ban::{BanEntry, BanList};
pub use id_queue::{ID_SPACE, IdQueue};
pub use spill::{FileSpill, MemorySpill, SpillStore};

// ============================================================================
// Defaults
// ============================================================================

/// Messages returned by one [`HistoryStore::get_batch`] call at most.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default maximum number of participants.
pub const DEFAULT_MAX_USERS: u32 = 254;

/// Maximum title length in characters.
pub const MAX_TITLE_LEN: usize = 100;

// ============================================================================
// Errors
// ============================================================================

/// Returned when an append or reset would exceed the size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("history size limit reached ({current} + {requested} > {limit} bytes)")]
pub struct SizeLimitReached {
    pub current: u64,
    pub requested: u64,
    pub limit: u64,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("spill storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt spilled batch: {0}")]
    Decode(#[from] prost::DecodeError),
}

// ============================================================================
// Types
// ============================================================================

/// Independent session flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// Session survives when the last member leaves.
    pub persistent: bool,
    /// Chat is recorded into history instead of being delivered ephemerally.
    pub preserve_chat: bool,
    /// Not suitable for minors.
    pub nsfm: bool,
    /// Trusted users may kick and ban non-trusted users.
    pub deputies: bool,
}

/// A contiguous slice of history.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub messages: Vec<Envelope>,
    /// Index to request next. Equals the requested index if nothing was new.
    pub next: u64,
}

#[derive(Debug, Clone, Copy)]
struct SpilledBatch {
    start: u64,
    count: u64,
}

// ============================================================================
// History Store
// ============================================================================

pub struct HistoryStore {
    id: String,
    alias: String,
    founder: String,
    start_time: DateTime<Utc>,

    title: String,
    password_hash: Option<String>,
    opword_hash: Option<String>,
    max_users: u32,
    flags: SessionFlags,

    size_limit: u64,
    autoreset_threshold: u64,
    autoreset_threshold_base: u64,

    /// First retained index.
    first_index: u64,
    /// One past the last retained index.
    end_index: u64,
    size_bytes: u64,
    batch_size: usize,

    /// Messages from `cache_start` to `end_index`.
    cache: VecDeque<Envelope>,
    cache_start: u64,
    spill: Box<dyn SpillStore>,
    spilled: Vec<SpilledBatch>,

    id_queue: IdQueue,
    bans: BanList,
    /// Lowercased auth ids granted op status.
    auth_ops: HashSet<String>,
    /// Lowercased auth ids granted trust.
    auth_trusted: HashSet<String>,
    announcements: Vec<String>,

    terminated: bool,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("id", &self.id)
            .field("first_index", &self.first_index)
            .field("end_index", &self.end_index)
            .field("size_bytes", &self.size_bytes)
            .field("spilled_batches", &self.spilled.len())
            .finish_non_exhaustive()
    }
}

impl HistoryStore {
    /// Create an empty history kept entirely in memory.
    pub fn new(id: impl Into<String>, founder: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alias: String::new(),
            founder: founder.into(),
            start_time: Utc::now(),
            title: String::new(),
            password_hash: None,
            opword_hash: None,
            max_users: DEFAULT_MAX_USERS,
            flags: SessionFlags::default(),
            size_limit: 0,
            autoreset_threshold: 0,
            autoreset_threshold_base: 0,
            first_index: 0,
            end_index: 0,
            size_bytes: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            cache: VecDeque::new(),
            cache_start: 0,
            spill: Box::new(MemorySpill::new()),
            spilled: Vec::new(),
            id_queue: IdQueue::new(),
            bans: BanList::new(),
            auth_ops: HashSet::new(),
            auth_trusted: HashSet::new(),
            announcements: Vec::new(),
            terminated: false,
        }
    }

    pub fn with_spill(mut self, spill: Box<dyn SpillStore>) -> Self {
        self.spill = spill;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    // ------------------------------------------------------------------------
    // Log
    // ------------------------------------------------------------------------

    /// Append a message. Returns the index it was stored at.
    pub fn add_message(&mut self, msg: &Envelope) -> Result<u64, SizeLimitReached> {
        let len = msg.byte_len();
        self.check_size(self.size_bytes, len)?;

        self.cache.push_back(msg.clone());
        self.size_bytes += len;
        let index = self.end_index;
        self.end_index += 1;
        Ok(index)
    }

    /// Fetch the next batch starting at `from`.
    ///
    /// A cursor from before the retained window starts at `first_index`.
    pub fn get_batch(&mut self, from: u64) -> Result<Batch, HistoryError> {
        let start = from.max(self.first_index);
        if start >= self.end_index {
            return Ok(Batch {
                messages: Vec::new(),
                next: from,
            });
        }

        let messages = if start < self.cache_start {
            self.load_spilled(start)?
        } else {
            let offset = (start - self.cache_start) as usize;
            self.cache
                .iter()
                .skip(offset)
                .take(self.batch_size)
                .cloned()
                .collect()
        };

        let next = start + messages.len() as u64;
        Ok(Batch { messages, next })
    }

    fn load_spilled(&mut self, start: u64) -> Result<Vec<Envelope>, HistoryError> {
        let Some(slot) = self
            .spilled
            .iter()
            .position(|b| start >= b.start && start < b.start + b.count)
        else {
            return Ok(Vec::new());
        };
        let batch = self.spilled[slot];

        let blob = self.spill.load(slot)?;
        let mut buf = blob.as_slice();
        let mut messages = Vec::with_capacity(batch.count as usize);
        while !buf.is_empty() {
            messages.push(Envelope::decode_length_delimited(&mut buf)?);
        }

        let skip = (start - batch.start) as usize;
        Ok(messages.into_iter().skip(skip).collect())
    }

    /// Move whole batches every consumer has read past out of the cache.
    ///
    /// `min_index` is the lowest cursor among live consumers.
    pub fn cleanup_batches(&mut self, min_index: u64) {
        while self.cache.len() >= self.batch_size
            && self.cache_start + self.batch_size as u64 <= min_index
        {
            let mut blob = Vec::new();
            for msg in self.cache.iter().take(self.batch_size) {
                blob.extend(msg.encode_length_delimited_to_vec());
            }

            if let Err(e) = self.spill.store(&blob) {
                // Keep it in memory then. Nothing is lost.
                warn!(session = %self.id, error = %e, "failed to spill history batch");
                return;
            }

            self.cache.drain(..self.batch_size);
            self.spilled.push(SpilledBatch {
                start: self.cache_start,
                count: self.batch_size as u64,
            });
            self.cache_start += self.batch_size as u64;
        }
    }

    /// Replace the retained window with `messages`.
    ///
    /// On error the old window is left untouched.
    pub fn reset(&mut self, messages: Vec<Envelope>) -> Result<(), SizeLimitReached> {
        let total: u64 = messages.iter().map(Envelope::byte_len).sum();
        self.check_size(0, total)?;

        if let Err(e) = self.spill.clear() {
            warn!(session = %self.id, error = %e, "failed to clear spilled history");
        }
        self.spilled.clear();

        self.first_index = self.end_index;
        self.cache_start = self.end_index;
        self.end_index += messages.len() as u64;
        self.cache = messages.into();
        self.size_bytes = total;
        Ok(())
    }

    /// Drop all content and release backing storage.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if let Err(e) = self.spill.release() {
            warn!(session = %self.id, error = %e, "failed to release spilled history");
        }
        self.spilled.clear();
        self.cache.clear();
        self.cache_start = self.end_index;
        self.first_index = self.end_index;
    }

    fn check_size(&self, current: u64, requested: u64) -> Result<(), SizeLimitReached> {
        if self.size_limit > 0 && current + requested > self.size_limit {
            return Err(SizeLimitReached {
                current,
                requested,
                limit: self.size_limit,
            });
        }
        Ok(())
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn end_index(&self) -> u64 {
        self.end_index
    }

    /// Number of retained messages.
    pub fn len(&self) -> u64 {
        self.end_index - self.first_index
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// True once the size limit has been reached.
    pub fn is_out_of_space(&self) -> bool {
        self.size_limit > 0 && self.size_bytes >= self.size_limit
    }

    // ------------------------------------------------------------------------
    // Limits
    // ------------------------------------------------------------------------

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    /// Hard size limit in bytes. 0 means unlimited.
    pub fn set_size_limit(&mut self, limit: u64) {
        self.size_limit = limit;
    }

    /// Configured autoreset threshold. 0 disables autoreset.
    pub fn autoreset_threshold(&self) -> u64 {
        self.autoreset_threshold
    }

    pub fn set_autoreset_threshold(&mut self, threshold: u64) {
        self.autoreset_threshold = match self.size_limit {
            0 => threshold,
            limit => threshold.min(limit),
        };
    }

    pub fn autoreset_threshold_base(&self) -> u64 {
        self.autoreset_threshold_base
    }

    /// Server-wide minimum applied on top of the configured threshold.
    pub fn set_autoreset_threshold_base(&mut self, base: u64) {
        self.autoreset_threshold_base = base;
    }

    /// Threshold actually in force: disabled stays disabled, otherwise the
    /// larger of the configured value and the server base.
    pub fn effective_autoreset_threshold(&self) -> u64 {
        match self.autoreset_threshold {
            0 => 0,
            t => t.max(self.autoreset_threshold_base),
        }
    }

    // ------------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn set_alias(&mut self, alias: impl Into<String>) {
        self.alias = alias.into();
    }

    /// Alias if one is set, else the id.
    pub fn id_or_alias(&self) -> &str {
        if self.alias.is_empty() {
            &self.id
        } else {
            &self.alias
        }
    }

    pub fn founder(&self) -> &str {
        &self.founder
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Set the title, truncated to [`MAX_TITLE_LEN`] characters.
    pub fn set_title(&mut self, title: &str) {
        self.title = title.chars().take(MAX_TITLE_LEN).collect();
    }

    pub fn password_hash(&self) -> Option<&str> {
        self.password_hash.as_deref()
    }

    pub fn set_password_hash(&mut self, hash: Option<String>) {
        self.password_hash = hash;
    }

    pub fn has_password(&self) -> bool {
        self.password_hash.is_some()
    }

    pub fn opword_hash(&self) -> Option<&str> {
        self.opword_hash.as_deref()
    }

    pub fn set_opword_hash(&mut self, hash: Option<String>) {
        self.opword_hash = hash;
    }

    pub fn has_opword(&self) -> bool {
        self.opword_hash.is_some()
    }

    pub fn max_users(&self) -> u32 {
        self.max_users
    }

    pub fn set_max_users(&mut self, max_users: u32) {
        self.max_users = max_users.clamp(1, ID_SPACE as u32);
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: SessionFlags) {
        self.flags = flags;
    }

    // ------------------------------------------------------------------------
    // Ids, bans, grants
    // ------------------------------------------------------------------------

    pub fn id_queue(&self) -> &IdQueue {
        &self.id_queue
    }

    pub fn id_queue_mut(&mut self) -> &mut IdQueue {
        &mut self.id_queue
    }

    pub fn bans(&self) -> &BanList {
        &self.bans
    }

    pub fn bans_mut(&mut self) -> &mut BanList {
        &mut self.bans
    }

    /// True if any authenticated user has a persisted op grant.
    pub fn has_auth_ops(&self) -> bool {
        !self.auth_ops.is_empty()
    }

    pub fn is_auth_op(&self, auth_id: &str) -> bool {
        self.auth_ops.contains(&auth_id.to_lowercase())
    }

    pub fn set_auth_op(&mut self, auth_id: &str, op: bool) {
        let key = auth_id.to_lowercase();
        if op {
            self.auth_ops.insert(key);
        } else {
            self.auth_ops.remove(&key);
        }
    }

    pub fn is_auth_trusted(&self, auth_id: &str) -> bool {
        self.auth_trusted.contains(&auth_id.to_lowercase())
    }

    pub fn set_auth_trusted(&mut self, auth_id: &str, trusted: bool) {
        let key = auth_id.to_lowercase();
        if trusted {
            self.auth_trusted.insert(key);
        } else {
            self.auth_trusted.remove(&key);
        }
    }

    // ------------------------------------------------------------------------
    // Announcements
    // ------------------------------------------------------------------------

    /// Directory URLs this session should be re-listed at on restore.
    pub fn announcements(&self) -> &[String] {
        &self.announcements
    }

    pub fn add_announcement(&mut self, url: &str) {
        if !self.announcements.iter().any(|u| u == url) {
            self.announcements.push(url.to_string());
        }
    }

    pub fn remove_announcement(&mut self, url: &str) {
        self.announcements.retain(|u| u != url);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn drawing(n: u8) -> Envelope {
        Envelope::drawing(1, u32::from(n), vec![n; 8])
    }

    fn drain(history: &mut HistoryStore, mut from: u64) -> Vec<Envelope> {
        let mut out = Vec::new();
        loop {
            let batch = history.get_batch(from).unwrap();
            if batch.messages.is_empty() {
                return out;
            }
            from = batch.next;
            out.extend(batch.messages);
        }
    }

    /// Replaying from the first index reconstructs append order exactly.
    #[test]
    fn test_full_replay_preserves_order() {
        let mut history = HistoryStore::new("s1", "alice").with_batch_size(3);
        let msgs: Vec<_> = (0..10).map(drawing).collect();
        for m in &msgs {
            history.add_message(m).unwrap();
        }

        assert_eq!(history.len(), 10);
        assert_eq!(history.end_index() - history.first_index(), 10);
        let first = history.first_index();
        assert_eq!(drain(&mut history, first), msgs);
    }

    /// A rejected append changes nothing.
    #[test]
    fn test_append_past_limit_is_atomic() {
        let mut history = HistoryStore::new("s1", "alice");
        let msg = drawing(1);
        let len = msg.byte_len();
        history.set_size_limit(len * 2 + len / 2);

        history.add_message(&msg).unwrap();
        history.add_message(&msg).unwrap();
        let before = (history.end_index(), history.size_bytes());

        let err = history.add_message(&msg).unwrap_err();
        assert_eq!(err.limit, history.size_limit());
        assert_eq!((history.end_index(), history.size_bytes()), before);
    }

    /// A message that exactly fills the limit is accepted.
    #[test]
    fn test_append_up_to_limit_exactly() {
        let mut history = HistoryStore::new("s1", "alice");
        let msg = drawing(1);
        history.set_size_limit(msg.byte_len() * 2);

        history.add_message(&msg).unwrap();
        history.add_message(&msg).unwrap();
        assert!(history.is_out_of_space());
    }

    /// get_batch echoes the cursor when nothing is new.
    #[test]
    fn test_caught_up_cursor_is_echoed() {
        let mut history = HistoryStore::new("s1", "alice");
        history.add_message(&drawing(1)).unwrap();

        let batch = history.get_batch(1).unwrap();
        assert!(batch.messages.is_empty());
        assert_eq!(batch.next, 1);
    }

    /// Reset starts a new window after the old one.
    #[test]
    fn test_reset_replaces_window() {
        let mut history = HistoryStore::new("s1", "alice");
        for n in 0..5 {
            history.add_message(&drawing(n)).unwrap();
        }

        let snapshot = vec![drawing(100), drawing(101)];
        history.reset(snapshot.clone()).unwrap();

        assert_eq!(history.first_index(), 5);
        assert_eq!(history.end_index(), 7);
        assert_eq!(
            history.size_bytes(),
            snapshot.iter().map(Envelope::byte_len).sum::<u64>()
        );

        // A stale cursor lands on the new snapshot
        assert_eq!(drain(&mut history, 2), snapshot);
    }

    /// A reset that doesn't fit leaves the old window in place.
    #[test]
    fn test_failed_reset_keeps_old_content() {
        let mut history = HistoryStore::new("s1", "alice");
        let msg = drawing(1);
        history.set_size_limit(msg.byte_len() * 2);
        history.add_message(&msg).unwrap();

        assert!(history.reset(vec![drawing(2), drawing(3), drawing(4)]).is_err());
        assert_eq!(history.first_index(), 0);
        assert_eq!(history.end_index(), 1);
        assert_eq!(drain(&mut history, 0), vec![msg]);
    }

    /// Spilled batches are replayed transparently.
    #[test]
    fn test_cleanup_spills_read_batches() {
        let mut history = HistoryStore::new("s1", "alice").with_batch_size(4);
        let msgs: Vec<_> = (0..10).map(drawing).collect();
        for m in &msgs {
            history.add_message(m).unwrap();
        }

        // Everyone has read up to 9: two full batches can go
        history.cleanup_batches(9);
        assert_eq!(history.cache.len(), 2);
        assert_eq!(history.spilled.len(), 2);

        // A late cursor in the middle of a spilled batch still works
        assert_eq!(drain(&mut history, 5), msgs[5..].to_vec());
        assert_eq!(drain(&mut history, 0), msgs);
    }

    /// Unread batches are never spilled.
    #[test]
    fn test_cleanup_respects_slowest_cursor() {
        let mut history = HistoryStore::new("s1", "alice").with_batch_size(4);
        for n in 0..10 {
            history.add_message(&drawing(n)).unwrap();
        }

        history.cleanup_batches(3);
        assert!(history.spilled.is_empty());
        assert_eq!(history.cache.len(), 10);
    }

    /// File spill round trip and release on terminate.
    #[test]
    fn test_file_spill_released_on_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.spill");
        let spill = FileSpill::create(&path).unwrap();
        let mut history = HistoryStore::new("s1", "alice")
            .with_batch_size(2)
            .with_spill(Box::new(spill));

        let msgs: Vec<_> = (0..4).map(drawing).collect();
        for m in &msgs {
            history.add_message(m).unwrap();
        }
        history.cleanup_batches(4);
        assert_eq!(drain(&mut history, 0), msgs);

        history.terminate();
        history.terminate();
        assert!(history.is_terminated());
        assert!(!path.exists());
    }

    /// Disabled stays disabled, otherwise the server base wins if larger.
    #[test]
    fn test_effective_autoreset_threshold() {
        let mut history = HistoryStore::new("s1", "alice");
        history.set_autoreset_threshold_base(1000);

        history.set_autoreset_threshold(0);
        assert_eq!(history.effective_autoreset_threshold(), 0);

        history.set_autoreset_threshold(500);
        assert_eq!(history.effective_autoreset_threshold(), 1000);

        history.set_autoreset_threshold(5000);
        assert_eq!(history.effective_autoreset_threshold(), 5000);
    }

    #[test]
    fn test_title_truncated() {
        let mut history = HistoryStore::new("s1", "alice");
        history.set_title(&"x".repeat(150));
        assert_eq!(history.title().chars().count(), MAX_TITLE_LEN);
    }

    #[test]
    fn test_auth_grants_case_insensitive() {
        let mut history = HistoryStore::new("s1", "alice");
        history.set_auth_op("Alice", true);
        assert!(history.is_auth_op("alice"));
        assert!(history.has_auth_ops());

        history.set_auth_op("ALICE", false);
        assert!(!history.has_auth_ops());
    }
}
