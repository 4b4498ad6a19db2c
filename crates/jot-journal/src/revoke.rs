//! Revoke table.
//!
//! Records blocks that an older transaction logged but that have since been
//! freed or reused. The external recovery scanner consults the revoke
//! records the commit engine writes from this table, so it never replays a
//! stale log copy onto a repurposed block. An entry is cancelled when the
//! same block is legitimately re-enlisted via `get_create_access`.

use jot_types::{BlockNumber, TxId};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Block-number-keyed revoke map, scoped by the transaction that revoked.
#[derive(Debug, Default)]
pub struct RevokeTable {
    entries: Mutex<HashMap<u64, TxId>>,
}

impl RevokeTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `block` was revoked by transaction `tid`. A newer revoke
    /// of the same block supersedes an older one.
    pub fn insert(&self, block: BlockNumber, tid: TxId) {
        let mut entries = self.entries.lock();
        match entries.get(&block.0) {
            Some(existing) if existing.after(tid) => {}
            _ => {
                entries.insert(block.0, tid);
            }
        }
        tracing::debug!(target: "jot::revoke", block = block.0, tid = tid.0, "revoke_insert");
    }

    /// Cancel any outstanding revoke for `block` (the block is being
    /// legitimately reused). Returns whether an entry existed.
    pub fn cancel(&self, block: BlockNumber) -> bool {
        let removed = self.entries.lock().remove(&block.0).is_some();
        if removed {
            tracing::debug!(target: "jot::revoke", block = block.0, "revoke_cancel");
        }
        removed
    }

    /// Whether `block` currently has a revoke entry.
    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        self.entries.lock().contains_key(&block.0)
    }

    /// Remove and return the blocks revoked by transaction `tid`, sorted
    /// for deterministic record encoding. Called once per commit.
    #[must_use]
    pub fn drain_for(&self, tid: TxId) -> Vec<u64> {
        let mut entries = self.entries.lock();
        let mut drained: Vec<u64> = entries
            .iter()
            .filter(|(_, t)| **t == tid)
            .map(|(block, _)| *block)
            .collect();
        for block in &drained {
            entries.remove(block);
        }
        drained.sort_unstable();
        drained
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
