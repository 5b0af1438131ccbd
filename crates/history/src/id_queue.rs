//! Participant id recycling.
//!
//! Ids are handed out round-robin from a queue of 1..=255. A returning name
//! is offered the id it used last time. Releasing an id moves it to the back
//! of the queue so it is the last candidate for reuse; there is no timed
//! expiry, reuse only happens under allocation pressure.

use std::collections::{HashMap, VecDeque};

use tandem_wire::ParticipantId;

/// Number of assignable ids (1..=255).
pub const ID_SPACE: usize = 255;

#[derive(Debug, Clone)]
pub struct IdQueue {
    ids: VecDeque<ParticipantId>,
    /// Lowercased display name → last id used.
    names: HashMap<String, ParticipantId>,
}

impl Default for IdQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl IdQueue {
    pub fn new() -> Self {
        Self {
            ids: (1..=ParticipantId::MAX).collect(),
            names: HashMap::new(),
        }
    }

    /// Id last bound to this name, or 0 if the name is unknown.
    pub fn get_id_for_name(&self, name: &str) -> ParticipantId {
        self.names.get(&name.to_lowercase()).copied().unwrap_or(0)
    }

    pub fn set_id_for_name(&mut self, id: ParticipantId, name: &str) {
        self.names.insert(name.to_lowercase(), id);
    }

    /// Next id in round-robin order. The returned id moves to the back.
    pub fn next_id(&mut self) -> ParticipantId {
        match self.ids.pop_front() {
            Some(id) => {
                self.ids.push_back(id);
                id
            }
            None => 0,
        }
    }

    /// Push an id to the back of the queue so it isn't reused right away.
    pub fn reserve_id(&mut self, id: ParticipantId) {
        if id == 0 {
            return;
        }
        if let Some(pos) = self.ids.iter().position(|&i| i == id) {
            self.ids.remove(pos);
        }
        self.ids.push_back(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_skips_zero() {
        let mut q = IdQueue::new();
        assert_eq!(q.next_id(), 1);
        assert_eq!(q.next_id(), 2);
        for _ in 0..253 {
            assert_ne!(q.next_id(), 0);
        }
        // Wrapped around
        assert_eq!(q.next_id(), 1);
    }

    #[test]
    fn test_name_binding_is_case_insensitive() {
        let mut q = IdQueue::new();
        assert_eq!(q.get_id_for_name("Alice"), 0);
        q.set_id_for_name(42, "Alice");
        assert_eq!(q.get_id_for_name("alice"), 42);
    }

    #[test]
    fn test_reserved_id_goes_last() {
        let mut q = IdQueue::new();
        q.reserve_id(1);
        assert_eq!(q.next_id(), 2);

        // 1 is only handed out after every other id had its turn
        let mut seen = Vec::new();
        for _ in 0..ID_SPACE - 1 {
            seen.push(q.next_id());
        }
        assert!(seen.contains(&1));
        assert_eq!(*seen.last().unwrap(), 1);
    }
}
