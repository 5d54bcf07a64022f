//! Chat history
//!
//! A bounded ring of the most recent chat entries, shared by the history
//! replay at login and `get_history`. Broadcast delivery itself goes
//! through the per-session mailboxes; this module only owns the record.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::protocol::messages::Uid;

/// Maximum retained chat entries; older entries are evicted
pub const HISTORY_CAPACITY: usize = 500;

/// How a chat entry was delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Chat,
    Broadcast,
    Unicast,
}

/// One stored chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    pub ts: String,
    pub uid: Uid,
    pub username: String,
    pub text: String,
    pub kind: Delivery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_uid: Option<Uid>,
}

/// Bounded chat history ring
#[derive(Debug)]
pub struct ChatLog {
    entries: Mutex<VecDeque<ChatEntry>>,
}

impl ChatLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    /// Append an entry, evicting the oldest at capacity
    pub fn append(&self, entry: ChatEntry) {
        let mut entries = self.entries.lock().expect("chat log lock poisoned");
        if entries.len() == HISTORY_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Copy of the retained entries, oldest first
    pub fn recent(&self) -> Vec<ChatEntry> {
        let entries = self.entries.lock().expect("chat log lock poisoned");
        entries.iter().cloned().collect()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.lock().expect("chat log lock poisoned").len()
    }

    /// True when no entries are retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new()
    }
}
