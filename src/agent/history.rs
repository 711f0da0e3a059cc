//! Bounded window of completed conversation turns.
//!
//! Only the heartbeat engine reads this; it never feeds back into prompt
//! construction. Turns are appended once per successfully completed request
//! and never mutated afterwards.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Default number of turns retained.
pub const DEFAULT_HISTORY_CAPACITY: usize = 24;

/// One completed request/response exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub user_text: String,
    pub assistant_text: String,
    pub completed_at: DateTime<Utc>,
}

/// Append-only ring of the most recent turns; oldest evicted first.
#[derive(Debug)]
pub struct ConversationRing {
    turns: VecDeque<ConversationTurn>,
    capacity: usize,
}

impl ConversationRing {
    /// Create a ring holding at most `capacity` turns.
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Append a completed turn, evicting the oldest when full.
    pub fn push(&mut self, turn: ConversationTurn) {
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    /// Most recently completed turn.
    pub fn latest(&self) -> Option<&ConversationTurn> {
        self.turns.back()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

impl Default for ConversationRing {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
