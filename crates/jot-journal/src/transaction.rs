//! Transaction bookkeeping.
//!
//! A transaction's scalar counters (state, users, credits, deadline) live
//! under the journal's `state` lock; its buffer role lists live under the
//! `lists` lock so that cross-list moves — including moves between two
//! transactions' lists — are atomic.

use crate::bufinfo::BufferList;
use jot_types::BlockNumber;
use std::collections::VecDeque;
use std::time::Instant;

/// Transaction lifecycle states.
///
/// RUNNING → LOCKED (no new handles; existing handles drain) → FLUSH
/// (ordered data being written) → COMMIT (log blocks and commit record
/// being written) → FINISHED (on the checkpoint list).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Running,
    Locked,
    Flush,
    Commit,
    Finished,
}

/// Scalar bookkeeping for one transaction (under the `state` lock).
#[derive(Debug)]
pub struct TxRecord {
    pub state: TxState,
    /// Attached-handle count. The commit engine waits for this to drain
    /// before freezing the transaction.
    pub users: u32,
    /// Credits currently reserved against the log by attached handles.
    /// After all handles detach this is the number of metadata blocks the
    /// commit will actually log.
    pub reserved_credits: u32,
    /// Commit deadline: the daemon commits this transaction once passed.
    pub expires: Instant,
    /// First log block this transaction's commit wrote (tail candidate).
    /// Meaningful once the commit engine has started on it.
    pub log_start: u32,
}

impl TxRecord {
    #[must_use]
    pub fn new(expires: Instant) -> Self {
        Self {
            state: TxState::Running,
            users: 0,
            reserved_credits: 0,
            expires,
            log_start: 0,
        }
    }
}

/// Buffer role lists for one transaction (under the `lists` lock).
///
/// Order within a list is enlistment order; the commit engine logs metadata
/// in that order.
#[derive(Debug, Default)]
pub struct TxLists {
    pub reserved: VecDeque<BlockNumber>,
    pub metadata: VecDeque<BlockNumber>,
    pub data: VecDeque<BlockNumber>,
    pub forget: VecDeque<BlockNumber>,
    pub shadow: VecDeque<BlockNumber>,
    pub locked: VecDeque<BlockNumber>,
    /// Buffers whose home writes this transaction's checkpoint still owes.
    pub checkpoint: VecDeque<BlockNumber>,
}

impl TxLists {
    fn list_mut(&mut self, which: BufferList) -> Option<&mut VecDeque<BlockNumber>> {
        match which {
            BufferList::Reserved => Some(&mut self.reserved),
            BufferList::Metadata => Some(&mut self.metadata),
            BufferList::Data => Some(&mut self.data),
            BufferList::Forget => Some(&mut self.forget),
            BufferList::Shadow => Some(&mut self.shadow),
            BufferList::Locked => Some(&mut self.locked),
            BufferList::None => None,
        }
    }

    /// Remove `block` from the `which` role list. Returns whether it was
    /// present.
    pub fn unfile(&mut self, which: BufferList, block: BlockNumber) -> bool {
        let Some(list) = self.list_mut(which) else {
            return false;
        };
        if let Some(pos) = list.iter().position(|b| *b == block) {
            list.remove(pos);
            true
        } else {
            false
        }
    }

    /// Append `block` to the `which` role list.
    pub fn file(&mut self, which: BufferList, block: BlockNumber) {
        if let Some(list) = self.list_mut(which) {
            list.push_back(block);
        }
    }

    /// All role lists (not checkpoint) are empty.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.reserved.is_empty()
            && self.metadata.is_empty()
            && self.data.is_empty()
            && self.forget.is_empty()
            && self.shadow.is_empty()
            && self.locked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_and_unfile_round_trip() {
        let mut lists = TxLists::default();
        lists.file(BufferList::Reserved, BlockNumber(10));
        lists.file(BufferList::Reserved, BlockNumber(11));
        assert!(!lists.is_drained());

        assert!(lists.unfile(BufferList::Reserved, BlockNumber(10)));
        assert!(!lists.unfile(BufferList::Reserved, BlockNumber(10)));
        assert!(lists.unfile(BufferList::Reserved, BlockNumber(11)));
        assert!(lists.is_drained());
    }

    #[test]
    fn unfile_from_none_is_noop() {
        let mut lists = TxLists::default();
        assert!(!lists.unfile(BufferList::None, BlockNumber(1)));
    }

    #[test]
    fn metadata_preserves_enlistment_order() {
        let mut lists = TxLists::default();
        for block in [5_u64, 3, 9] {
            lists.file(BufferList::Metadata, BlockNumber(block));
        }
        let order: Vec<u64> = lists.metadata.iter().map(|b| b.0).collect();
        assert_eq!(order, vec![5, 3, 9]);
    }

    #[test]
    fn checkpoint_list_is_not_part_of_drain() {
        let mut lists = TxLists::default();
        lists.checkpoint.push_back(BlockNumber(1));
        assert!(lists.is_drained());
    }
}
