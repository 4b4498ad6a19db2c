//! Checkpointing: retiring committed transactions from the log.
//!
//! A committed transaction stays on the checkpoint queue until every
//! metadata block it logged has also reached its home location. Only then
//! may the log tail advance over the transaction's blocks and hand the
//! space back for reuse. The on-disk superblock pointer always moves before
//! the in-memory free count grows, so recovery never starts its scan inside
//! space that was already handed back.

use crate::journal::{Journal, JournalLists, JournalState};
use jot_error::{JotError, Result};
use jot_types::TxId;
use std::sync::Arc;

/// Log blocks between `from` and `to` in a circular area of `len` blocks
/// whose data region starts at `first`.
fn wrap_distance(len: u32, first: u32, from: u32, to: u32) -> u32 {
    if to >= from {
        to - from
    } else {
        (len - from) + (to - first)
    }
}

/// Where the tail could move to, and the sequence recovery should expect
/// there, given current checkpoint debt.
fn tail_candidate(state: &JournalState, lists: &JournalLists) -> (u32, TxId) {
    if let Some(&front) = lists.checkpoint.front() {
        if let Some(rec) = state.txns.get(&front) {
            return (rec.log_start, TxId(front));
        }
    }
    if let Some(tid) = state.committing {
        let start = state.txns.get(&tid.0).map_or(state.head, |rec| rec.log_start);
        return (start, tid);
    }
    // Log empty: the next thing to appear at the head is the running
    // transaction's commit, or whatever transaction starts next.
    (state.head, state.running.unwrap_or(state.next_tx))
}

/// Advance the log tail over fully retired transactions, persisting the new
/// on-disk pointer before growing the free pool. No-op when nothing moved.
pub(crate) fn advance_tail(journal: &Arc<Journal>) -> Result<()> {
    let (tail, oldest, errno, moved, log_in_use) = {
        let lists = journal.lists.lock();
        let state = journal.state.lock();
        let (tail, oldest) = tail_candidate(&state, &lists);
        (
            tail,
            oldest,
            state.errno,
            tail != state.tail || oldest != state.oldest_tx,
            state.sb.start != 0,
        )
    };
    if !moved {
        return Ok(());
    }
    // A clean on-disk superblock stays clean; commits dirty it themselves.
    if log_in_use {
        journal.update_superblock(tail, oldest, errno)?;
    }
    let lists = journal.lists.lock();
    let mut state = journal.state.lock();
    let (tail, oldest) = tail_candidate(&state, &lists);
    let freed = wrap_distance(journal.len, journal.first, state.tail, tail);
    state.free += freed;
    state.tail = tail;
    state.oldest_tx = oldest;
    tracing::debug!(
        target: "jot::checkpoint",
        id = journal.id,
        tail,
        oldest = oldest.0,
        freed,
        "tail_advanced"
    );
    Ok(())
}

/// Retire the oldest checkpoint transaction: write home every metadata
/// block it still owes, then advance the tail past it.
///
/// Returns whether a transaction was retired. Blocks a home write while its
/// buffer belongs to a live transaction by forcing that transaction to
/// commit first.
pub(crate) fn checkpoint_pass(journal: &Arc<Journal>) -> Result<bool> {
    let Some(tid) = journal.lists.lock().checkpoint.front().copied() else {
        return Ok(false);
    };

    let mut wrote = 0_u32;
    loop {
        if journal.is_aborted() {
            return Err(JotError::Aborted {
                errno: journal.errno(),
            });
        }
        let next = {
            let lists = journal.lists.lock();
            lists
                .txs
                .get(&tid)
                .and_then(|tx| tx.checkpoint.front().copied())
        };
        let Some(block) = next else {
            break;
        };

        // Decide ownership under the buffer's I/O lock: a claim acquires
        // this lock before enlisting, so an owner absent here cannot appear
        // while the home write is in flight.
        let buf = journal.cache.find_or_create(block);
        buf.lock();
        let live_owner = {
            let lists = journal.lists.lock();
            lists.bufs.get(&block.0).and_then(|info| info.tx)
        };

        // The live buffer carries a newer transaction's changes; the home
        // write must wait for those to commit.
        if let Some(owner) = live_owner {
            buf.unlock();
            journal.request_commit(owner);
            journal.wait_for_commit(owner)?;
            continue;
        }

        if buf.is_uptodate() && buf.is_dirty() {
            if let Err(e) = journal.cache.write_home_locked(&buf) {
                buf.unlock();
                return Err(e);
            }
            wrote += 1;
        }
        buf.unlock();
        let mut guard = journal.lists.lock();
        let lists = &mut *guard;
        if let Some(tx) = lists.txs.get_mut(&tid) {
            if tx.checkpoint.front() == Some(&block) {
                tx.checkpoint.pop_front();
            }
        }
        if let Some(info) = lists.bufs.get_mut(&block.0) {
            info.checkpoint_tx = None;
            if info.tx.is_none() {
                info.jot_dirty = false;
            }
        }
        lists.release_if_unlinked(block);
    }

    if wrote > 0 {
        journal.cache.sync()?;
    }

    {
        let mut guard = journal.lists.lock();
        let lists = &mut *guard;
        if lists.checkpoint.front() == Some(&tid) {
            lists.checkpoint.pop_front();
        }
        if lists.txs.get(&tid).is_some_and(|tx| tx.is_drained() && tx.checkpoint.is_empty()) {
            lists.txs.remove(&tid);
        }
        let mut state = journal.state.lock();
        state.txns.remove(&tid);
    }
    tracing::debug!(
        target: "jot::checkpoint",
        id = journal.id,
        tid,
        wrote,
        "checkpoint_retired"
    );
    advance_tail(journal)?;
    Ok(true)
}

/// Reclaim log space until at least `needed` reservable blocks exist:
/// checkpoint what can be checkpointed, commit what can be committed, and
/// fail with no-space once neither helps.
pub(crate) fn reclaim_log_space(journal: &Arc<Journal>, needed: u32) -> Result<()> {
    loop {
        {
            let state = journal.state.lock();
            if state.aborted {
                return Err(JotError::Aborted { errno: state.errno });
            }
            if Journal::log_free_space(&state, &journal.config) >= needed {
                return Ok(());
            }
        }
        if checkpoint_pass(journal)? {
            continue;
        }
        let target = {
            let state = journal.state.lock();
            state.committing.or(state.running)
        };
        match target {
            Some(tid) => {
                journal.request_commit(tid);
                journal.wait_for_commit(tid)?;
            }
            None => {
                let free = journal.free_blocks();
                return Err(JotError::NoSpace(format!(
                    "log cannot supply {needed} blocks ({free} free after full reclaim)"
                )));
            }
        }
    }
}
