//! Commit engine and the per-journal commit daemon.
//!
//! The daemon owns the commit pipeline: it locks the running transaction,
//! waits for its handles to drain, writes ordered data to home locations,
//! then revoke records, descriptor and metadata blocks, and finally the
//! commit record — each barrier separated by a device sync. Everything else
//! in the journal only ever asks the daemon to commit and waits.

use crate::bufinfo::BufferList;
use crate::checkpoint;
use crate::journal::Journal;
use crate::ondisk::{self, Tag};
use crate::transaction::TxState;
use jot_error::{JotError, Result};
use jot_types::{BlockNumber, TxId};
use std::sync::Arc;
use std::time::Instant;

/// Spawn the commit daemon for a freshly loaded journal.
pub(crate) fn start_daemon(journal: &Arc<Journal>) -> Result<()> {
    let worker = Arc::clone(journal);
    let handle = std::thread::Builder::new()
        .name(format!("jot-commit/{}", journal.id))
        .spawn(move || daemon_main(&worker))
        .map_err(JotError::Io)?;
    *journal.daemon.lock() = Some(handle);
    Ok(())
}

fn daemon_main(journal: &Arc<Journal>) {
    tracing::debug!(target: "jot::commit", id = journal.id, "commit_daemon_started");
    let mut state = journal.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        if state.aborted {
            journal.commit_wake.wait(&mut state);
            continue;
        }

        let now = Instant::now();
        let due = state.running.filter(|tid| {
            state.commit_request.at_or_after(*tid)
                || state.txns.get(&tid.0).is_some_and(|rec| now >= rec.expires)
        });
        if let Some(tid) = due {
            drop(state);
            if let Err(e) = commit_transaction(journal, tid) {
                tracing::error!(
                    target: "jot::commit",
                    id = journal.id,
                    tid = tid.0,
                    error = %e,
                    "commit_failed"
                );
                journal.abort(e.to_errno());
            }
            state = journal.state.lock();
            continue;
        }

        let deadline = state
            .running
            .and_then(|tid| state.txns.get(&tid.0))
            .map(|rec| rec.expires);
        match deadline {
            Some(deadline) => {
                let _ = journal.commit_wake.wait_until(&mut state, deadline);
            }
            None => journal.commit_wake.wait(&mut state),
        }
    }
    drop(state);
    tracing::debug!(target: "jot::commit", id = journal.id, "commit_daemon_stopped");
}

/// Commit `tid`: make every dirtied metadata block of the transaction
/// durable in the log, with ordered data written home first.
pub(crate) fn commit_transaction(journal: &Arc<Journal>, tid: TxId) -> Result<()> {
    let block_size = journal.block_size.as_usize();

    // Phase 1: lock the transaction and wait for its handles to drain. Once
    // `running` clears, new handles start a successor transaction.
    {
        let mut state = journal.state.lock();
        if state.running != Some(tid) {
            return Ok(());
        }
        if let Some(rec) = state.txns.get_mut(&tid.0) {
            rec.state = TxState::Locked;
        }
        loop {
            if state.aborted {
                return Err(JotError::Aborted { errno: state.errno });
            }
            if state.txns.get(&tid.0).map_or(true, |rec| rec.users == 0) {
                break;
            }
            journal.users_drained.wait(&mut state);
        }
        state.running = None;
        state.committing = Some(tid);
        let head = state.head;
        // Credits consumed by enlisted buffers go back to the free pool;
        // the log writes below re-consume space block by block.
        let credits = state.txns.get(&tid.0).map_or(0, |rec| rec.reserved_credits);
        state.free += credits;
        if let Some(rec) = state.txns.get_mut(&tid.0) {
            rec.state = TxState::Flush;
            rec.log_start = head;
        }
    }
    journal.commit_done.notify_all();
    tracing::debug!(target: "jot::commit", id = journal.id, tid = tid.0, "commit_started");

    // Phase 2: ordered data reaches its home location before the commit
    // record. These blocks are never logged.
    let data_blocks: Vec<BlockNumber> = {
        let mut guard = journal.lists.lock();
        let lists = &mut *guard;
        match lists.txs.get_mut(&tid.0) {
            Some(tx) => {
                let blocks: Vec<BlockNumber> = tx.data.drain(..).collect();
                for &block in &blocks {
                    tx.locked.push_back(block);
                    if let Some(info) = lists.bufs.get_mut(&block.0) {
                        info.which = BufferList::Locked;
                    }
                }
                blocks
            }
            None => Vec::new(),
        }
    };
    if !data_blocks.is_empty() {
        for &block in &data_blocks {
            let buf = journal.cache.find_or_create(block);
            if buf.is_uptodate() && buf.is_dirty() {
                journal.cache.write_home(&buf)?;
            }
        }
        journal.cache.sync()?;
        let mut guard = journal.lists.lock();
        let lists = &mut *guard;
        for &block in &data_blocks {
            if let Some(tx) = lists.txs.get_mut(&tid.0) {
                tx.unfile(BufferList::Locked, block);
            }
            if let Some(info) = lists.bufs.get_mut(&block.0) {
                // A newer transaction may have claimed the block while its
                // home write was in flight.
                if let Some(next) = info.next_tx.take() {
                    info.tx = Some(next);
                    info.modified = true;
                    let which = if info.jot_dirty {
                        BufferList::Metadata
                    } else {
                        BufferList::Reserved
                    };
                    info.which = which;
                    lists.txs.entry(next.0).or_default().file(which, block);
                } else {
                    info.tx = None;
                    info.which = BufferList::None;
                }
            }
            lists.release_if_unlinked(block);
        }
    }

    if let Some(rec) = journal.state.lock().txns.get_mut(&tid.0) {
        rec.state = TxState::Commit;
    }

    // Phase 3: revoke records, then metadata with descriptors, then the
    // commit record. A transaction that touched nothing writes nothing.
    let revoked = journal.revoke.drain_for(tid);
    let metadata: Vec<BlockNumber> = {
        let guard = journal.lists.lock();
        guard
            .txs
            .get(&tid.0)
            .map(|tx| tx.metadata.iter().copied().collect())
            .unwrap_or_default()
    };

    if !revoked.is_empty() || !metadata.is_empty() {
        // If the on-disk superblock currently claims a clean log, point it
        // at this transaction before the first log write, or recovery would
        // never look.
        let refresh = {
            let state = journal.state.lock();
            (state.sb.start == 0).then_some((state.tail, state.oldest_tx, state.errno))
        };
        if let Some((tail, oldest, errno)) = refresh {
            journal.update_superblock(tail, oldest, errno)?;
        }

        for chunk in revoked.chunks(ondisk::revokes_per_block(block_size)) {
            let mut blocks = Vec::with_capacity(chunk.len());
            for &block in chunk {
                blocks.push(u32::try_from(block).map_err(|_| {
                    JotError::Format(format!("revoked block {block} exceeds 32-bit record"))
                })?);
            }
            let slot = journal.next_log_block()?;
            journal.write_log_block(slot, &ondisk::encode_revoke_block(tid, &blocks, block_size))?;
        }

        for batch in metadata.chunks(ondisk::tags_per_block(block_size)) {
            // The descriptor occupies the slot just before its blocks, but
            // is written after them, once every escape flag is known.
            let descriptor_slot = journal.next_log_block()?;
            let mut tags = Vec::with_capacity(batch.len());
            for &block in batch {
                tags.push(log_one_metadata_block(journal, tid, block)?);
            }
            let descriptor = ondisk::encode_descriptor(tid, &tags, &journal.uuid, block_size);
            journal.write_log_block(descriptor_slot, &descriptor)?;
        }

        // Everything the commit record vouches for must be durable first.
        journal.cache.sync()?;
        let slot = journal.next_log_block()?;
        journal.write_log_block(slot, &ondisk::encode_commit_block(tid, block_size))?;
        journal.cache.sync()?;
        tracing::debug!(
            target: "jot::commit",
            id = journal.id,
            tid = tid.0,
            metadata = metadata.len(),
            revoked = revoked.len(),
            "commit_record_durable"
        );
    } else {
        tracing::trace!(target: "jot::commit", id = journal.id, tid = tid.0, "commit_empty");
    }

    // Phase 4: tear down the transaction's remaining lists, queueing home
    // writes for checkpoint and handing claimed buffers to their next
    // transaction.
    let has_checkpoint_work = {
        let mut guard = journal.lists.lock();
        let lists = &mut *guard;
        let (forget, reserved) = match lists.txs.get_mut(&tid.0) {
            Some(tx) => (
                tx.forget.drain(..).collect::<Vec<BlockNumber>>(),
                tx.reserved.drain(..).collect::<Vec<BlockNumber>>(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        for block in forget {
            let Some(info) = lists.bufs.get_mut(&block.0) else {
                continue;
            };
            // This commit supersedes any older copy still owed to disk.
            if let Some(old) = info.checkpoint_tx.take() {
                if let Some(old_tx) = lists.txs.get_mut(&old.0) {
                    if let Some(pos) = old_tx.checkpoint.iter().position(|b| *b == block) {
                        old_tx.checkpoint.remove(pos);
                    }
                }
            }
            if info.jot_dirty {
                info.checkpoint_tx = Some(tid);
                lists.txs.entry(tid.0).or_default().checkpoint.push_back(block);
                journal.cache.find_or_create(block).mark_dirty();
            }
            info.frozen_data = None;
            info.committed_data = None;
            if let Some(next) = info.next_tx.take() {
                info.tx = Some(next);
                info.modified = true;
                let which = if info.jot_dirty {
                    BufferList::Metadata
                } else {
                    BufferList::Reserved
                };
                info.which = which;
                lists.txs.entry(next.0).or_default().file(which, block);
            } else {
                info.tx = None;
                info.which = BufferList::None;
                info.modified = false;
            }
            lists.release_if_unlinked(block);
        }

        // Access granted but never dirtied: the buffers were never logged.
        for block in reserved {
            let Some(info) = lists.bufs.get_mut(&block.0) else {
                continue;
            };
            if let Some(next) = info.next_tx.take() {
                info.tx = Some(next);
                info.which = BufferList::Reserved;
                info.modified = true;
                lists
                    .txs
                    .entry(next.0)
                    .or_default()
                    .file(BufferList::Reserved, block);
            } else {
                info.tx = None;
                info.which = BufferList::None;
                info.modified = false;
            }
            lists.release_if_unlinked(block);
        }

        let has_cp = lists
            .txs
            .get(&tid.0)
            .is_some_and(|tx| !tx.checkpoint.is_empty());
        if has_cp {
            lists.checkpoint.push_back(tid.0);
        } else {
            lists.txs.remove(&tid.0);
        }
        has_cp
    };

    {
        let mut state = journal.state.lock();
        state.committing = None;
        state.commit_sequence = tid;
        if has_checkpoint_work {
            if let Some(rec) = state.txns.get_mut(&tid.0) {
                rec.state = TxState::Finished;
            }
        } else {
            state.txns.remove(&tid.0);
        }
    }
    journal.commit_done.notify_all();

    // With no checkpoint debt the log space is reclaimable immediately.
    checkpoint::advance_tail(journal)?;
    tracing::debug!(target: "jot::commit", id = journal.id, tid = tid.0, "commit_finished");
    Ok(())
}

/// Write one metadata buffer's stable copy into the log, escaping content
/// that collides with the journal magic. Holds the buffer's I/O lock across
/// the write so a concurrent `get_write_access` cannot mutate the copy
/// being chosen.
fn log_one_metadata_block(journal: &Arc<Journal>, tid: TxId, block: BlockNumber) -> Result<Tag> {
    let blocknr = u32::try_from(block.0).map_err(|_| {
        JotError::Format(format!("metadata block {} exceeds 32-bit tag", block.0))
    })?;
    let buf = journal.cache.find_or_create(block);
    buf.lock();
    let result = (|| {
        let mut payload = {
            let mut guard = journal.lists.lock();
            let lists = &mut *guard;
            let Some(info) = lists.bufs.get_mut(&block.0) else {
                return Err(JotError::Invalid(format!(
                    "metadata block {} lost its journal record",
                    block.0
                )));
            };
            if let Some(tx) = lists.txs.get_mut(&tid.0) {
                tx.unfile(BufferList::Metadata, block);
                tx.file(BufferList::Shadow, block);
            }
            info.which = BufferList::Shadow;
            // A frozen copy exists if a newer transaction already claimed
            // the live buffer; otherwise the live contents are stable while
            // we hold the buffer lock.
            info.frozen_data.take().unwrap_or_else(|| buf.snapshot())
        };

        let escaped = ondisk::needs_escape(&payload);
        if escaped {
            payload[..4].fill(0);
        }
        let slot = journal.next_log_block()?;
        journal.write_log_block(slot, &payload)?;

        {
            let mut guard = journal.lists.lock();
            let lists = &mut *guard;
            if let Some(tx) = lists.txs.get_mut(&tid.0) {
                tx.unfile(BufferList::Shadow, block);
                tx.file(BufferList::Forget, block);
            }
            if let Some(info) = lists.bufs.get_mut(&block.0) {
                info.which = BufferList::Forget;
            }
        }
        Ok(Tag { blocknr, escaped })
    })();
    buf.unlock();
    result
}
