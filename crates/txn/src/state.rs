//! In-memory transaction state (§3.6): the key-state map, the
//! post-commit task queue, and the transaction id/path/pid triple that
//! seeds the rollback log header.

use std::collections::BTreeMap;

/// How a key was touched within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Written,
    Deleted,
}

/// A side-effect queued by a write made inside a transaction. Held back
/// from the Store's background queue until commit succeeds (§4.6.6).
#[derive(Debug, Clone, PartialEq)]
pub enum PendingTask {
    ExpireSet { key: String, expiration: i64 },
}

/// The transaction's in-memory record: `{ id, path, log_file, date, pid,
/// keys, queue, aborting?, committing? }` (§3.6).
pub struct Transaction {
    pub id: String,
    pub path: String,
    pub date: i64,
    pub pid: u32,
    pub keys: BTreeMap<String, KeyState>,
    pub queue: Vec<PendingTask>,
    aborting: bool,
    committing: bool,
}

impl Transaction {
    pub fn new(id: String, path: String, date: i64, pid: u32) -> Self {
        Transaction {
            id,
            path,
            date,
            pid,
            keys: BTreeMap::new(),
            queue: Vec::new(),
            aborting: false,
            committing: false,
        }
    }

    pub fn mark_written(&mut self, key: &str) {
        self.keys.insert(key.to_string(), KeyState::Written);
    }

    pub fn mark_deleted(&mut self, key: &str) {
        self.keys.insert(key.to_string(), KeyState::Deleted);
    }

    pub fn state_of(&self, key: &str) -> Option<KeyState> {
        self.keys.get(key).copied()
    }

    pub fn enqueue(&mut self, task: PendingTask) {
        self.queue.push(task);
    }

    pub fn take_queue(&mut self) -> Vec<PendingTask> {
        std::mem::take(&mut self.queue)
    }

    pub fn begin_committing(&mut self) -> bool {
        if self.aborting || self.committing {
            return false;
        }
        self.committing = true;
        true
    }

    pub fn begin_aborting(&mut self) -> bool {
        if self.aborting {
            return false;
        }
        self.aborting = true;
        true
    }
}
