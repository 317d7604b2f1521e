//! Deciding which in-flight response is allowed to touch the view.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};

use shared::domain::{ChannelId, MessageId};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A list or map the client fetches and overwrites as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    ChannelMessages(ChannelId),
    ThreadReplies(MessageId),
    Reactions(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    resource: Resource,
    seq: u64,
}

impl Ticket {
    pub fn resource(&self) -> Resource {
        self.resource
    }
}

/// Issues monotonic per-resource tickets. Only the response holding the
/// newest ticket for its resource may be applied.
#[derive(Debug, Default)]
pub struct RequestSequencer {
    latest: Mutex<HashMap<Resource, u64>>,
}

impl RequestSequencer {
    pub fn issue(&self, resource: Resource) -> Ticket {
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = latest.entry(resource).or_insert(0);
        *seq += 1;
        Ticket {
            resource,
            seq: *seq,
        }
    }

    pub fn is_current(&self, ticket: &Ticket) -> bool {
        let latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        latest.get(&ticket.resource) == Some(&ticket.seq)
    }
}

/// One async lock per key, created on first use.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries nobody holds or waits on can go.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
