//! Session registry
//!
//! The authoritative identity source. Every other component refers to
//! participants by `uid` only; resolving a uid to a name happens here,
//! under the registry lock.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::current_timestamp;
use crate::error::{HubError, Result};
use crate::protocol::messages::{ParticipantEntry, Uid, MAX_NAME_LEN};

/// A logged-in participant
#[derive(Debug, Clone)]
pub struct Participant {
    pub uid: Uid,
    pub username: String,
    pub joined_at: String,
    pub presenting: bool,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_uid: Uid,
    participants: HashMap<Uid, Participant>,
}

/// Registry of connected participants with monotonic uid allocation
#[derive(Debug)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    /// Create an empty registry; the first allocated uid is 1
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                next_uid: 1,
                participants: HashMap::new(),
            }),
        }
    }

    /// Register a participant and return its freshly allocated uid
    ///
    /// Uids are strictly increasing and never reused within a server
    /// lifetime, even after the participant unregisters.
    pub fn register(&self, name: &str) -> Result<Uid> {
        let name = name.trim();
        if name.is_empty() {
            return Err(HubError::auth("username must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(HubError::auth(format!(
                "username exceeds {} bytes",
                MAX_NAME_LEN
            )));
        }

        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let uid = inner.next_uid;
        inner.next_uid += 1;
        inner.participants.insert(
            uid,
            Participant {
                uid,
                username: name.to_string(),
                joined_at: current_timestamp(),
                presenting: false,
            },
        );
        Ok(uid)
    }

    /// Remove a participant; idempotent
    pub fn unregister(&self, uid: Uid) -> Option<Participant> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.participants.remove(&uid)
    }

    /// Consistent list of currently registered participants, ordered by uid
    pub fn snapshot(&self) -> Vec<ParticipantEntry> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut entries: Vec<ParticipantEntry> = inner
            .participants
            .values()
            .map(|p| ParticipantEntry {
                uid: p.uid,
                username: p.username.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.uid);
        entries
    }

    /// Look up a participant by uid
    pub fn lookup(&self, uid: Uid) -> Option<Participant> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.participants.get(&uid).cloned()
    }

    /// Look up just the display name
    pub fn username(&self, uid: Uid) -> Option<String> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.participants.get(&uid).map(|p| p.username.clone())
    }

    /// Set or clear the presenting flag; returns false for unknown uids
    pub fn set_presenting(&self, uid: Uid, presenting: bool) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        match inner.participants.get_mut(&uid) {
            Some(p) => {
                p.presenting = presenting;
                true
            }
            None => false,
        }
    }

    /// Number of registered participants
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.participants.len()
    }

    /// True when nobody is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
