//! Handles: a thread's ticket into the running transaction.
//!
//! A handle reserves log credits up front and enlists buffers against them.
//! Handles are reentrant per thread and per journal: a nested `start` on the
//! same thread returns the same underlying handle with a bumped reference
//! count, so a filesystem operation can call into helpers that open their
//! own handles without deadlocking against itself. Handles are deliberately
//! not `Send` (they hold an `Rc`); each thread gets its own.

use crate::bufinfo::BufferList;
use crate::checkpoint;
use crate::journal::Journal;
use crate::transaction::{TxRecord, TxState};
use jot_block::Buffer;
use jot_error::{JotError, Result};
use jot_types::{BlockNumber, TxId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

thread_local! {
    /// Live handle per journal for this thread, keyed by journal id.
    static ACTIVE: RefCell<HashMap<u64, Rc<RefCell<HandleInner>>>> =
        RefCell::new(HashMap::new());
}

#[derive(Debug)]
struct HandleInner {
    tid: TxId,
    /// Credits not yet consumed by enlisted buffers.
    credits: u32,
    /// Reentrant `start` depth on this thread.
    ref_count: u32,
    /// Final `stop` blocks until the transaction commits.
    sync: bool,
}

/// What kind of access is being requested for a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Write,
    Create,
    Undo,
}

/// An open update against the running transaction.
pub struct Handle {
    journal: Arc<Journal>,
    inner: Rc<RefCell<HandleInner>>,
    done: bool,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Handle")
            .field("tid", &inner.tid.0)
            .field("credits", &inner.credits)
            .field("ref_count", &inner.ref_count)
            .finish()
    }
}

impl Journal {
    /// Open a handle against the running transaction, reserving `nblocks`
    /// credits (one per metadata block this update may dirty).
    ///
    /// Blocks while an update barrier is held, while the running transaction
    /// is locked for commit, or while log space must be reclaimed. Nested
    /// calls on the same thread return the same handle; the nested `nblocks`
    /// is ignored.
    pub fn start(self: &Arc<Self>, nblocks: u32) -> Result<Handle> {
        if nblocks == 0 {
            return Err(JotError::Invalid("handle needs at least one credit".to_owned()));
        }
        if nblocks > self.max_trans {
            return Err(JotError::NoSpace(format!(
                "requested {nblocks} credits, transaction cap is {}",
                self.max_trans
            )));
        }

        let nested = ACTIVE.with(|map| map.borrow().get(&self.id).cloned());
        if let Some(inner) = nested {
            inner.borrow_mut().ref_count += 1;
            return Ok(Handle {
                journal: Arc::clone(self),
                inner,
                done: false,
            });
        }

        let tid = self.attach(nblocks)?;
        let inner = Rc::new(RefCell::new(HandleInner {
            tid,
            credits: nblocks,
            ref_count: 1,
            sync: false,
        }));
        ACTIVE.with(|map| {
            map.borrow_mut().insert(self.id, Rc::clone(&inner));
        });
        tracing::trace!(
            target: "jot::handle",
            id = self.id,
            tid = tid.0,
            credits = nblocks,
            "handle_started"
        );
        Ok(Handle {
            journal: Arc::clone(self),
            inner,
            done: false,
        })
    }

    /// Join the running transaction (creating one if needed), reserving
    /// `nblocks` credits against the log.
    fn attach(self: &Arc<Self>, nblocks: u32) -> Result<TxId> {
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return Err(JotError::Aborted { errno: state.errno });
            }
            if !state.loaded {
                return Err(JotError::Invalid("journal is not loaded".to_owned()));
            }
            if state.barrier > 0 {
                self.commit_done.wait(&mut state);
                continue;
            }

            let Some(tid) = state.running else {
                let tid = state.next_tx;
                state.next_tx = tid.next();
                state
                    .txns
                    .insert(tid.0, TxRecord::new(Instant::now() + self.config.commit_interval));
                state.running = Some(tid);
                tracing::debug!(target: "jot::txn", id = self.id, tid = tid.0, "transaction_started");
                // Rearm the daemon's commit timer for the new transaction.
                self.commit_wake.notify_all();
                continue;
            };

            let (tx_state, reserved) = match state.txns.get(&tid.0) {
                Some(rec) => (rec.state, rec.reserved_credits),
                None => {
                    return Err(JotError::Invalid(format!(
                        "running transaction {} has no record",
                        tid.0
                    )))
                }
            };
            // A transaction whose commit was already requested is closing;
            // joining it would race the daemon. Wait for its successor.
            if tx_state != TxState::Running || state.commit_request.at_or_after(tid) {
                self.commit_done.wait(&mut state);
                continue;
            }

            // Would we push the transaction over its credit cap? Close it
            // out and retry against its successor.
            if reserved + nblocks > self.max_trans {
                if tid.after(state.commit_request) {
                    state.commit_request = tid;
                    self.commit_wake.notify_all();
                }
                self.commit_done.wait(&mut state);
                continue;
            }

            if Journal::log_free_space(&state, &self.config) < nblocks {
                drop(state);
                checkpoint::reclaim_log_space(self, nblocks)?;
                state = self.state.lock();
                continue;
            }

            if let Some(rec) = state.txns.get_mut(&tid.0) {
                rec.users += 1;
                rec.reserved_credits += nblocks;
            }
            state.free -= nblocks;
            return Ok(tid);
        }
    }
}

impl Handle {
    /// The transaction this handle is attached to.
    #[must_use]
    pub fn tid(&self) -> TxId {
        self.inner.borrow().tid
    }

    /// Credits not yet consumed.
    #[must_use]
    pub fn credits_left(&self) -> u32 {
        self.inner.borrow().credits
    }

    /// Make the final `stop` wait until this transaction's commit record is
    /// durable.
    pub fn set_sync(&self) {
        self.inner.borrow_mut().sync = true;
    }

    fn check_live(&self) -> Result<()> {
        let state = self.journal.state.lock();
        if state.aborted {
            return Err(JotError::Aborted { errno: state.errno });
        }
        Ok(())
    }

    // -- buffer access -------------------------------------------------------

    /// Declare intent to modify `buffer`'s contents as metadata.
    ///
    /// If the buffer still belongs to the committing transaction, a private
    /// frozen copy is taken for that commit's log write and the live buffer
    /// is handed to this transaction, so the caller may modify it
    /// immediately without waiting for the commit.
    pub fn get_write_access(&self, buffer: &Arc<Buffer>) -> Result<()> {
        self.access(buffer, Access::Write)
    }

    /// Like [`get_write_access`](Self::get_write_access) for a freshly
    /// allocated block: no prior content is preserved, and any pending
    /// revoke for the block is cancelled so recovery will replay the new
    /// contents.
    pub fn get_create_access(&self, buffer: &Arc<Buffer>) -> Result<()> {
        self.access(buffer, Access::Create)
    }

    /// Like [`get_write_access`](Self::get_write_access), additionally
    /// preserving the to-be-committed contents so callers (allocation
    /// bitmaps) can consult the state the pending commit will expose.
    pub fn get_undo_access(&self, buffer: &Arc<Buffer>) -> Result<()> {
        self.access(buffer, Access::Undo)
    }

    fn access(&self, buffer: &Arc<Buffer>, access: Access) -> Result<()> {
        self.check_live()?;
        let tid = self.inner.borrow().tid;
        // Buffer I/O lock first, then `lists`: serializes against the commit
        // engine's log write of this buffer.
        buffer.lock();
        let result = self.enlist(buffer, tid, access);
        buffer.unlock();
        result
    }

    fn enlist(&self, buffer: &Arc<Buffer>, tid: TxId, access: Access) -> Result<()> {
        let block = buffer.block();
        let mut guard = self.journal.lists.lock();
        let lists = &mut *guard;

        let already_ours = lists
            .bufs
            .get(&block.0)
            .is_some_and(|info| info.tx == Some(tid) || info.next_tx == Some(tid));
        if !already_ours {
            let mut inner = self.inner.borrow_mut();
            if inner.credits == 0 {
                return Err(JotError::NoSpace(
                    "handle has no credits left for this buffer".to_owned(),
                ));
            }
            inner.credits -= 1;
        }

        let info = lists
            .bufs
            .entry(block.0)
            .or_insert_with(|| crate::bufinfo::BufInfo::new(block));
        if !already_ours {
            match info.tx {
                None => {
                    info.tx = Some(tid);
                    info.which = BufferList::Reserved;
                    info.modified = true;
                    lists
                        .txs
                        .entry(tid.0)
                        .or_default()
                        .file(BufferList::Reserved, block);
                }
                Some(owner) => {
                    debug_assert!(tid.after(owner));
                    // The owner is committing. If its log copy has not been
                    // written yet, freeze the current contents for that
                    // write; either way, claim the live buffer for this
                    // transaction.
                    if info.which == BufferList::Metadata && info.frozen_data.is_none() {
                        info.frozen_data = Some(buffer.snapshot());
                        tracing::trace!(
                            target: "jot::handle",
                            block = block.0,
                            owner = owner.0,
                            claimant = tid.0,
                            "frozen_copy_taken"
                        );
                    }
                    info.next_tx = Some(tid);
                }
            }
        }

        match access {
            Access::Undo => {
                if info.committed_data.is_none() {
                    info.committed_data = Some(buffer.snapshot());
                }
            }
            Access::Create => {
                drop(guard);
                self.journal.revoke.cancel(block);
                buffer.mark_uptodate();
            }
            Access::Write => {}
        }
        Ok(())
    }

    // -- dirtying -------------------------------------------------------------

    /// Mark an enlisted metadata buffer as modified: its contents will be
    /// logged by this transaction's commit. The buffer is intentionally not
    /// marked dirty in the cache; it must not reach its home location before
    /// the commit record does.
    pub fn dirty_metadata(&self, buffer: &Arc<Buffer>) -> Result<()> {
        self.check_live()?;
        let tid = self.inner.borrow().tid;
        let block = buffer.block();
        let mut guard = self.journal.lists.lock();
        let lists = &mut *guard;
        let Some(info) = lists.bufs.get_mut(&block.0) else {
            return Err(JotError::Invalid(format!(
                "block {} was never enlisted",
                block.0
            )));
        };
        if info.next_tx == Some(tid) {
            // Still owned by the committing transaction; the commit-end
            // handoff will file it on our metadata list.
            info.jot_dirty = true;
            return Ok(());
        }
        if info.tx != Some(tid) {
            return Err(JotError::Invalid(format!(
                "block {} is not enlisted in this transaction",
                block.0
            )));
        }
        info.jot_dirty = true;
        if info.which != BufferList::Metadata {
            let prev = info.which;
            if let Some(tx_lists) = lists.txs.get_mut(&tid.0) {
                tx_lists.unfile(prev, block);
                tx_lists.file(BufferList::Metadata, block);
            }
            info.which = BufferList::Metadata;
        }
        Ok(())
    }

    /// File a data buffer for ordered writeout: it reaches its home location
    /// before this transaction's commit record. Consumes no credits and is
    /// never logged.
    pub fn dirty_data(&self, buffer: &Arc<Buffer>) -> Result<()> {
        self.check_live()?;
        let tid = self.inner.borrow().tid;
        let block = buffer.block();
        buffer.mark_dirty();
        let mut guard = self.journal.lists.lock();
        let lists = &mut *guard;
        let owner = lists.bufs.get(&block.0).and_then(|info| info.tx);
        match owner {
            // Already filed with us.
            Some(owner) if owner == tid => Ok(()),
            // An older committing transaction owns the block and its
            // ordered write may already be in flight. Write the newest
            // content home now; the pre-commit sync makes it durable before
            // this transaction's commit record.
            Some(_) => {
                drop(guard);
                self.journal.cache.write_home(buffer)
            }
            None => {
                let info = lists
                    .bufs
                    .entry(block.0)
                    .or_insert_with(|| crate::bufinfo::BufInfo::new(block));
                info.tx = Some(tid);
                info.which = BufferList::Data;
                lists
                    .txs
                    .entry(tid.0)
                    .or_default()
                    .file(BufferList::Data, block);
                Ok(())
            }
        }
    }

    // -- un-dirtying ------------------------------------------------------------

    /// The block no longer matters (it was freed): drop it from this
    /// transaction. Idempotent. The consumed credit is not returned.
    pub fn forget(&self, buffer: &Arc<Buffer>) -> Result<()> {
        self.check_live()?;
        let tid = self.inner.borrow().tid;
        let block = buffer.block();
        let mut guard = self.journal.lists.lock();
        let lists = &mut *guard;
        let Some(info) = lists.bufs.get_mut(&block.0) else {
            buffer.clear_dirty();
            return Ok(());
        };
        if info.next_tx == Some(tid) {
            // Drop only the claim. The committing owner's logged copy still
            // needs its checkpoint home write, which jot_dirty drives.
            info.next_tx = None;
        }
        if info.tx == Some(tid) {
            info.jot_dirty = false;
            buffer.clear_dirty();
            let prev = info.which;
            if let Some(tx_lists) = lists.txs.get_mut(&tid.0) {
                tx_lists.unfile(prev, block);
            }
            if info.checkpoint_tx.is_some() {
                // An older committed copy still owes a home write; keep the
                // buffer with this transaction so commit-end can drop that
                // obligation once this free is durable.
                info.which = BufferList::Forget;
                if let Some(tx_lists) = lists.txs.get_mut(&tid.0) {
                    tx_lists.file(BufferList::Forget, block);
                }
            } else {
                info.tx = None;
                info.which = BufferList::None;
                info.modified = false;
                info.frozen_data = None;
                info.committed_data = None;
                lists.release_if_unlinked(block);
            }
        } else if info.tx.is_some() {
            // Owned by the committing transaction; its log write proceeds.
            // The caller revokes the block separately if recovery must not
            // replay it.
            buffer.clear_dirty();
        }
        Ok(())
    }

    /// Record that `block` was freed and any copy of it in the log must not
    /// be replayed by recovery. Drops the buffer from this transaction
    /// first when a cached copy is supplied.
    pub fn revoke(&self, block: BlockNumber, buffer: Option<&Arc<Buffer>>) -> Result<()> {
        self.check_live()?;
        if let Some(buf) = buffer {
            self.forget(buf)?;
        }
        self.journal.revoke.insert(block, self.inner.borrow().tid);
        Ok(())
    }

    // -- credit management -------------------------------------------------------

    /// Try to grow this handle's reservation by `additional` credits.
    /// Returns `Ok(false)` when the transaction cannot accommodate them
    /// (caller should [`restart`](Self::restart) instead).
    pub fn extend(&self, additional: u32) -> Result<bool> {
        self.check_live()?;
        let tid = self.inner.borrow().tid;
        let mut state = self.journal.state.lock();
        let space = Journal::log_free_space(&state, &self.journal.config);
        let Some(rec) = state.txns.get_mut(&tid.0) else {
            return Err(JotError::Invalid(format!("transaction {} has no record", tid.0)));
        };
        if rec.state != TxState::Running {
            return Ok(false);
        }
        if rec.reserved_credits + additional > self.journal.max_trans {
            return Ok(false);
        }
        if space < additional {
            return Ok(false);
        }
        rec.reserved_credits += additional;
        state.free -= additional;
        drop(state);
        self.inner.borrow_mut().credits += additional;
        Ok(true)
    }

    /// Detach from the current transaction (triggering its commit) and
    /// re-attach to a fresh one with `nblocks` credits. All buffer state
    /// enlisted so far commits with the old transaction.
    pub fn restart(&mut self, nblocks: u32) -> Result<()> {
        if self.inner.borrow().ref_count > 1 {
            return Err(JotError::Invalid("cannot restart a nested handle".to_owned()));
        }
        let (tid, unused) = {
            let inner = self.inner.borrow();
            (inner.tid, inner.credits)
        };
        {
            let mut state = self.journal.state.lock();
            state.free += unused;
            if let Some(rec) = state.txns.get_mut(&tid.0) {
                rec.reserved_credits = rec.reserved_credits.saturating_sub(unused);
                rec.users -= 1;
                if rec.users == 0 {
                    self.journal.users_drained.notify_all();
                }
            }
            if tid.after(state.commit_request) {
                state.commit_request = tid;
                self.journal.commit_wake.notify_all();
            }
        }
        match self.journal.attach(nblocks) {
            Ok(new_tid) => {
                let mut inner = self.inner.borrow_mut();
                inner.tid = new_tid;
                inner.credits = nblocks;
                Ok(())
            }
            Err(e) => {
                // Already detached; make sure Drop does not detach again.
                self.done = true;
                ACTIVE.with(|map| {
                    map.borrow_mut().remove(&self.journal.id);
                });
                Err(e)
            }
        }
    }

    /// Close the handle, returning unused credits. The outermost `stop` of
    /// a sync handle blocks until the transaction's commit is durable.
    pub fn stop(mut self) -> Result<()> {
        if self.done {
            // A failed restart already detached this handle.
            return Ok(());
        }
        self.done = true;
        self.detach(true)
    }

    fn detach(&mut self, wait_sync: bool) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.ref_count > 1 {
                inner.ref_count -= 1;
                return Ok(());
            }
            inner.ref_count = 0;
        }
        ACTIVE.with(|map| {
            map.borrow_mut().remove(&self.journal.id);
        });

        let (tid, unused, sync) = {
            let inner = self.inner.borrow();
            (inner.tid, inner.credits, inner.sync)
        };
        let mut want_commit = sync;
        let aborted_errno = {
            let mut state = self.journal.state.lock();
            state.free += unused;
            if let Some(rec) = state.txns.get_mut(&tid.0) {
                rec.reserved_credits = rec.reserved_credits.saturating_sub(unused);
                rec.users = rec.users.saturating_sub(1);
                if Instant::now() >= rec.expires {
                    want_commit = true;
                }
                // A transaction holding more than half the cap is unlikely
                // to fit another big handle; close it out early.
                if rec.reserved_credits * 2 > self.journal.max_trans {
                    want_commit = true;
                }
                if rec.users == 0 {
                    self.journal.users_drained.notify_all();
                }
            }
            if want_commit && tid.after(state.commit_request) {
                state.commit_request = tid;
                self.journal.commit_wake.notify_all();
            }
            state.aborted.then_some(state.errno)
        };
        tracing::trace!(
            target: "jot::handle",
            id = self.journal.id,
            tid = tid.0,
            unused,
            sync,
            "handle_stopped"
        );
        if let Some(errno) = aborted_errno {
            return Err(JotError::Aborted { errno });
        }
        if sync && wait_sync {
            self.journal.wait_for_commit(tid)?;
        }
        Ok(())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.done {
            // Leaked handle (likely a panic unwinding): detach so the
            // transaction can commit, but never block on a sync wait here.
            let _ = self.detach(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use jot_block::{BufferCache, MemBlockDevice};
    use jot_types::BlockSize;
    use std::time::Duration;

    /// 128-block journal at the front of a 192-block device; home blocks
    /// live at 140+. Long commit interval keeps the daemon out of the way.
    fn test_journal() -> (Arc<Journal>, Arc<BufferCache>) {
        let bs = BlockSize::new(1024).expect("block size");
        let device = Arc::new(MemBlockDevice::new(bs, 192));
        let cache = Arc::new(BufferCache::new(device));
        let journal = Journal::new(
            Arc::clone(&cache),
            Arc::new(crate::journal::LinearMapper::new(BlockNumber(0))),
            128,
            [1_u8; 16],
            JournalConfig {
                commit_interval: Duration::from_secs(3600),
                min_reserved_blocks: 8,
                ..JournalConfig::default()
            },
        )
        .expect("journal");
        journal.create().expect("create");
        (journal, cache)
    }

    #[test]
    fn start_rejects_zero_and_oversized_requests() {
        let (journal, _cache) = test_journal();
        assert!(matches!(journal.start(0), Err(JotError::Invalid(_))));
        // Cap is len/4 = 32; rejected before any buffer is touched.
        assert!(matches!(journal.start(33), Err(JotError::NoSpace(_))));
        journal.close().expect("close");
    }

    #[test]
    fn nested_start_shares_the_handle() {
        let (journal, _cache) = test_journal();
        let outer = journal.start(4).expect("outer");
        let free_after_outer = journal.free_blocks();

        let inner = journal.start(10).expect("inner");
        assert_eq!(inner.tid(), outer.tid());
        // Nested start reserves nothing further.
        assert_eq!(journal.free_blocks(), free_after_outer);

        inner.stop().expect("inner stop");
        // Outer handle still attached.
        assert_eq!(journal.free_blocks(), free_after_outer);
        outer.stop().expect("outer stop");
        journal.close().expect("close");
    }

    #[test]
    fn stop_returns_unused_credits() {
        let (journal, cache) = test_journal();
        let free_before = journal.free_blocks();

        let handle = journal.start(4).expect("start");
        assert_eq!(journal.free_blocks(), free_before - 4);

        let buf = cache.find_or_create(BlockNumber(150));
        handle.get_create_access(&buf).expect("access");
        assert_eq!(handle.credits_left(), 3);
        handle.stop().expect("stop");

        // Three unused credits came back; one stays owed to the commit.
        assert_eq!(journal.free_blocks(), free_before - 1);
        journal.close().expect("close");
    }

    #[test]
    fn repeated_access_consumes_one_credit() {
        let (journal, cache) = test_journal();
        let handle = journal.start(4).expect("start");
        let buf = cache.find_or_create(BlockNumber(151));
        handle.get_create_access(&buf).expect("first");
        handle.get_write_access(&buf).expect("second");
        handle.get_undo_access(&buf).expect("third");
        assert_eq!(handle.credits_left(), 3);
        handle.stop().expect("stop");
        journal.close().expect("close");
    }

    #[test]
    fn buffer_sits_on_exactly_one_role_list() {
        let (journal, cache) = test_journal();
        let handle = journal.start(2).expect("start");
        let block = BlockNumber(152);
        let buf = cache.find_or_create(block);
        handle.get_create_access(&buf).expect("access");
        buf.with_data_mut(|data| data[0] = 0xAB);
        handle.dirty_metadata(&buf).expect("dirty");

        {
            let guard = journal.lists.lock();
            let info = guard.bufs.get(&block.0).expect("side record");
            assert_eq!(info.which, BufferList::Metadata);
            assert_eq!(info.tx, Some(handle.tid()));
            let tx = guard.txs.get(&handle.tid().0).expect("tx lists");
            assert!(tx.metadata.contains(&block));
            assert!(!tx.reserved.contains(&block));
            assert!(!tx.data.contains(&block));
        }
        handle.stop().expect("stop");
        journal.close().expect("close");
    }

    #[test]
    fn forget_is_idempotent() {
        let (journal, cache) = test_journal();
        let handle = journal.start(2).expect("start");
        let buf = cache.find_or_create(BlockNumber(153));
        handle.get_create_access(&buf).expect("access");
        buf.with_data_mut(|data| data[7] = 9);
        handle.dirty_metadata(&buf).expect("dirty");

        let credits = handle.credits_left();
        handle.forget(&buf).expect("forget");
        handle.forget(&buf).expect("forget again");
        // The consumed credit stays consumed.
        assert_eq!(handle.credits_left(), credits);
        {
            let guard = journal.lists.lock();
            assert!(guard.bufs.get(&153).is_none());
        }
        handle.stop().expect("stop");
        journal.close().expect("close");
    }

    #[test]
    fn extend_grows_within_cap_only() {
        let (journal, _cache) = test_journal();
        let handle = journal.start(4).expect("start");
        assert!(handle.extend(4).expect("extend"));
        assert_eq!(handle.credits_left(), 8);
        // 8 reserved already; 32 total cap.
        assert!(!handle.extend(25).expect("over cap"));
        handle.stop().expect("stop");
        journal.close().expect("close");
    }

    #[test]
    fn restart_moves_to_a_fresh_transaction() {
        let (journal, cache) = test_journal();
        let mut handle = journal.start(4).expect("start");
        let first = handle.tid();
        let buf = cache.find_or_create(BlockNumber(154));
        handle.get_create_access(&buf).expect("access");
        buf.with_data_mut(|data| data[0] = 1);
        handle.dirty_metadata(&buf).expect("dirty");

        handle.restart(4).expect("restart");
        assert!(handle.tid().after(first));
        assert_eq!(handle.credits_left(), 4);
        handle.stop().expect("stop");
        journal.close().expect("close");
    }

    #[test]
    fn dirty_metadata_requires_enlistment() {
        let (journal, cache) = test_journal();
        let handle = journal.start(2).expect("start");
        let buf = cache.find_or_create(BlockNumber(155));
        assert!(matches!(
            handle.dirty_metadata(&buf),
            Err(JotError::Invalid(_))
        ));
        handle.stop().expect("stop");
        journal.close().expect("close");
    }

    #[test]
    fn stop_after_a_failed_restart_is_inert() {
        let (journal, _cache) = test_journal();
        let free_initial = journal.free_blocks();

        let mut handle = journal.start(4).expect("start");
        journal.abort(libc::EIO);
        assert!(handle.restart(4).is_err());
        // The failed restart already detached and returned the credits.
        assert_eq!(journal.free_blocks(), free_initial);

        handle.stop().expect("stop after failed restart");
        assert_eq!(journal.free_blocks(), free_initial);
        assert!(journal.close().is_err());
    }

    #[test]
    fn dirty_data_writes_home_when_an_older_commit_owns_the_block() {
        let (journal, cache) = test_journal();
        let handle = journal.start(2).expect("start");
        let block = BlockNumber(157);

        // Stage the block as ordered data of an older, mid-commit
        // transaction whose home write already went out.
        {
            let mut guard = journal.lists.lock();
            let info = guard
                .bufs
                .entry(block.0)
                .or_insert_with(|| crate::bufinfo::BufInfo::new(block));
            info.tx = Some(TxId(0));
            info.which = BufferList::Data;
        }

        let buf = cache.find_or_create(block);
        buf.with_data_mut(|data| data.fill(0xD7));
        handle.dirty_data(&buf).expect("dirty data");

        // The newest content went straight home rather than being dropped.
        assert!(!buf.is_dirty());
        let mut raw = vec![0_u8; 1024];
        cache.device().read_block(block, &mut raw).expect("read");
        assert_eq!(raw, vec![0xD7_u8; 1024]);

        handle.stop().expect("stop");
        journal.close().expect("close");
    }

    #[test]
    fn undo_copy_is_readable_until_commit() {
        let (journal, cache) = test_journal();
        let handle = journal.start(2).expect("start");
        let block = BlockNumber(158);

        let buf = cache.find_or_create(block);
        buf.with_data_mut(|data| data.fill(0x01));
        handle.get_undo_access(&buf).expect("undo access");
        buf.with_data_mut(|data| data.fill(0x02));

        // The undo copy exposes the content the pending commit will show.
        let seen = journal
            .with_committed_data(block, <[u8]>::to_vec)
            .expect("undo copy");
        assert!(seen.iter().all(|&b| b == 0x01));
        assert!(journal
            .with_committed_data(BlockNumber(159), <[u8]>::to_vec)
            .is_none());

        handle.stop().expect("stop");
        journal.close().expect("close");
    }

    #[test]
    fn sync_stop_waits_for_the_commit() {
        let (journal, cache) = test_journal();
        let handle = journal.start(2).expect("start");
        let tid = handle.tid();
        let buf = cache.find_or_create(BlockNumber(156));
        handle.get_create_access(&buf).expect("access");
        buf.with_data_mut(|data| data.fill(0x5C));
        handle.dirty_metadata(&buf).expect("dirty");
        handle.set_sync();
        handle.stop().expect("stop");
        assert!(journal.committed_tid().at_or_after(tid));
        journal.close().expect("close");
    }
}
