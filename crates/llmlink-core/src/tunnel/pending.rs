//! Pending-request table owned by the tunnel session.
//!
//! Each relayed request gets an entry keyed by its id before dispatch. Entries
//! carry a sequence number so that output from a relay task whose entry was
//! already completed (or replaced after a reconnect) can be told apart and
//! dropped.

use std::collections::HashMap;

use tokio::task::AbortHandle;
use tokio::time::Instant;

#[derive(Debug)]
pub struct PendingRequest {
    pub seq: u64,
    pub started_at: Instant,
    pub path: String,
    task: Option<AbortHandle>,
}

impl PendingRequest {
    /// Stop the relay task, if one is attached.
    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Returned when inserting an id that is already pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateRequest {
    pub id: String,
}

#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<String, PendingRequest>,
    next_seq: u64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new request. An existing entry with the same id is left untouched.
    pub fn insert(&mut self, id: &str, path: &str) -> Result<u64, DuplicateRequest> {
        if self.entries.contains_key(id) {
            return Err(DuplicateRequest { id: id.to_string() });
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        self.entries.insert(
            id.to_string(),
            PendingRequest {
                seq,
                started_at: Instant::now(),
                path: path.to_string(),
                task: None,
            },
        );
        Ok(seq)
    }

    /// Attach the relay task so it can be aborted on disconnect.
    pub fn attach(&mut self, id: &str, seq: u64, task: AbortHandle) {
        match self.entries.get_mut(id) {
            Some(entry) if entry.seq == seq => entry.task = Some(task),
            _ => task.abort(),
        }
    }

    /// Whether `seq` is still the live entry for `id`.
    pub fn is_current(&self, id: &str, seq: u64) -> bool {
        self.entries.get(id).is_some_and(|entry| entry.seq == seq)
    }

    /// Remove the entry if `seq` still matches.
    pub fn complete(&mut self, id: &str, seq: u64) -> Option<PendingRequest> {
        if !self.is_current(id, seq) {
            return None;
        }
        self.entries.remove(id)
    }

    /// Remove every entry, aborting attached tasks.
    pub fn drain(&mut self) -> Vec<(String, PendingRequest)> {
        let drained: Vec<_> = self.entries.drain().collect();
        for (_, entry) in &drained {
            entry.abort();
        }
        drained
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
