//! Per-buffer journal side records.
//!
//! The journal never stores state inside the buffer cache; instead it keeps
//! a side map from block number to [`BufInfo`] under the journal's `lists`
//! lock. A record exists only while the journal has some interest in the
//! block (enlisted in a transaction, claimed by a pending one, or awaiting
//! checkpoint).

use jot_types::{BlockNumber, TxId};

/// Which role list of its owning transaction a buffer sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferList {
    /// Not on any list (checkpoint-only, or mid-move).
    None,
    /// Write access granted but not yet dirtied.
    Reserved,
    /// Dirtied metadata awaiting commit.
    Metadata,
    /// Ordered-mode data: must reach its home location before the commit
    /// record.
    Data,
    /// Content no longer matters; torn down at commit end.
    Forget,
    /// Stable copy currently being written to the log. Writers must wait.
    Shadow,
    /// Data block whose home write was submitted by the commit engine.
    Locked,
}

/// Journal bookkeeping attached to one block buffer.
#[derive(Debug)]
pub struct BufInfo {
    pub block: BlockNumber,
    /// Owning transaction. Non-`None` only while the buffer sits on exactly
    /// one of that transaction's role lists.
    pub tx: Option<TxId>,
    /// Pending owner once the current (committing) transaction finishes
    /// with the buffer. Set only while `tx` is the committing transaction.
    pub next_tx: Option<TxId>,
    /// Transaction whose checkpoint still needs this buffer's home write.
    pub checkpoint_tx: Option<TxId>,
    /// Role list tag for `tx`.
    pub which: BufferList,
    /// Private snapshot logged on behalf of the committing transaction
    /// while a newer transaction mutates the live buffer.
    pub frozen_data: Option<Vec<u8>>,
    /// Undo snapshot: the content the pending commit will make visible on
    /// disk, for callers that must check against it (allocation bitmaps).
    pub committed_data: Option<Vec<u8>>,
    /// Journal-private dirty bit, distinct from the cache dirty bit.
    pub jot_dirty: bool,
    /// A credit has been consumed for this buffer in the owning
    /// transaction.
    pub modified: bool,
}

impl BufInfo {
    #[must_use]
    pub fn new(block: BlockNumber) -> Self {
        Self {
            block,
            tx: None,
            next_tx: None,
            checkpoint_tx: None,
            which: BufferList::None,
            frozen_data: None,
            committed_data: None,
            jot_dirty: false,
            modified: false,
        }
    }

    /// Whether the journal still has any interest in this block. Records
    /// with no linkage are dropped from the side map.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.tx.is_some() || self.next_tx.is_some() || self.checkpoint_tx.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_is_unlinked() {
        let info = BufInfo::new(BlockNumber(9));
        assert!(!info.is_linked());
        assert_eq!(info.which, BufferList::None);
    }

    #[test]
    fn checkpoint_linkage_keeps_record_alive() {
        let mut info = BufInfo::new(BlockNumber(9));
        info.checkpoint_tx = Some(TxId(3));
        assert!(info.is_linked());
        info.checkpoint_tx = None;
        info.next_tx = Some(TxId(4));
        assert!(info.is_linked());
    }
}
