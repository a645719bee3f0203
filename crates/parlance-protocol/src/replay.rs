//! Bounded ring of recently emitted server envelopes.
//!
//! Every envelope the actor emits is appended here (already encoded) before
//! it is handed to the transport, so a reconnecting client can receive the
//! exact missed suffix with the original stanza ids.

use std::collections::VecDeque;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// One retained emission. The bytes are the encoded wire frame, shared
/// cheaply between the buffer and the retransmission path.
#[derive(Debug, Clone)]
pub struct ReplayEntry {
    pub stanza_id: i32,
    pub bytes: Bytes,
    pub emitted_at: DateTime<Utc>,
}

/// Result of a `since` lookup.
#[derive(Debug)]
pub struct ReplaySlice {
    /// Entries with |stanza id| greater than the requested point, in
    /// emission order.
    pub entries: Vec<ReplayEntry>,
    /// True when the requested point predates the buffer floor: the client
    /// missed envelopes that are no longer resident.
    pub gap: bool,
}

/// Oldest-first eviction at fixed capacity. Single writer (the actor);
/// the reconnect path reads while the actor is parked on the Configuration
/// event, so reads never race a mutation.
#[derive(Debug)]
pub struct ReplayBuffer {
    entries: VecDeque<ReplayEntry>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an emitted envelope, evicting the oldest at capacity.
    pub fn push(&mut self, stanza_id: i32, bytes: Bytes) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ReplayEntry {
            stanza_id,
            bytes,
            emitted_at: Utc::now(),
        });
    }

    /// All resident entries emitted after the point `|stanza_id| ==
    /// last_seen`, in emission order. `last_seen` is a magnitude, as
    /// declared by the client in its Configuration handshake.
    pub fn since(&self, last_seen: u32) -> ReplaySlice {
        let gap = last_seen < self.floor().saturating_sub(1);
        let entries = self
            .entries
            .iter()
            .filter(|e| e.stanza_id.unsigned_abs() > last_seen)
            .cloned()
            .collect();
        ReplaySlice { entries, gap }
    }

    /// |stanza id| of the oldest retained entry, or 0 when empty.
    pub fn floor(&self) -> u32 {
        self.entries
            .front()
            .map(|e| e.stanza_id.unsigned_abs())
            .unwrap_or(0)
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

    fn filled(n: i32, capacity: usize) -> ReplayBuffer {
        let mut buf = ReplayBuffer::new(capacity);
        for i in 1..=n {
            buf.push(-i, Bytes::from(format!("frame-{i}")));
        }
        buf
    }

    #[test]
    fn since_returns_exact_suffix() {
        let buf = filled(8, 16);
        let slice = buf.since(6);
        assert!(!slice.gap);
        let ids: Vec<i32> = slice.entries.iter().map(|e| e.stanza_id).collect();
        assert_eq!(ids, vec![-7, -8]);
    }

    #[test]
    fn eviction_is_oldest_first() {
        let buf = filled(10, 4);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.floor(), 7);
    }

    #[test]
    fn request_below_floor_signals_gap_and_returns_everything() {
        let buf = filled(500, 256);
        let slice = buf.since(100);
        assert!(slice.gap);
        assert_eq!(slice.entries.len(), 256);
        assert_eq!(slice.entries.first().unwrap().stanza_id, -245);
        assert_eq!(slice.entries.last().unwrap().stanza_id, -500);
    }

    #[test]
    fn request_at_floor_boundary_is_not_a_gap() {
        let buf = filled(10, 4);
        // floor is 7; a client that saw 6 missed nothing resident.
        assert!(!buf.since(6).gap);
        assert!(buf.since(5).gap);
    }

    #[test]
    fn since_on_empty_buffer_is_empty_without_gap() {
        let buf = ReplayBuffer::new(8);
        let slice = buf.since(0);
        assert!(slice.entries.is_empty());
        assert!(!slice.gap);
    }
}
