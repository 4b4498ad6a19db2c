//! The journal object: geometry, superblock, locks, transaction table, and
//! lifecycle (create / load / wipe / flush / abort / close).

use crate::bufinfo::BufInfo;
use crate::checkpoint;
use crate::commit;
use crate::config::JournalConfig;
use crate::ondisk::{self, Superblock};
use crate::revoke::RevokeTable;
use crate::transaction::{TxLists, TxRecord};
use jot_block::BufferCache;
use jot_error::{JotError, Result};
use jot_types::{BlockNumber, BlockSize, LogBlock, TxId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Smallest log the journal will manage (superblock + room for one
/// reasonable transaction).
pub const MIN_LOG_BLOCKS: u32 = 16;

/// Maps journal-relative log blocks to device-absolute blocks.
///
/// The filesystem supplies this: a journal stored in a regular file maps
/// through the file's block mapping; a dedicated journal device or a
/// contiguous reserved region uses [`LinearMapper`].
pub trait LogMapper: Send + Sync {
    fn map(&self, log_block: LogBlock) -> Result<BlockNumber>;
}

/// Contiguous log region starting at a fixed device block.
#[derive(Debug, Clone, Copy)]
pub struct LinearMapper {
    base: BlockNumber,
}

impl LinearMapper {
    #[must_use]
    pub fn new(base: BlockNumber) -> Self {
        Self { base }
    }
}

impl LogMapper for LinearMapper {
    fn map(&self, log_block: LogBlock) -> Result<BlockNumber> {
        self.base
            .0
            .checked_add(u64::from(log_block.0))
            .map(BlockNumber)
            .ok_or_else(|| JotError::Invalid("log block maps past device end".to_owned()))
    }
}

/// Journal-wide scalars, guarded by the `state` lock.
#[derive(Debug)]
pub(crate) struct JournalState {
    pub loaded: bool,
    pub aborted: bool,
    pub errno: i32,
    /// Active update barriers; handles may not attach while non-zero.
    pub barrier: u32,
    pub shutdown: bool,
    /// Id the next transaction will get.
    pub next_tx: TxId,
    /// Most recently committed transaction id.
    pub commit_sequence: TxId,
    /// Most recently requested commit target.
    pub commit_request: TxId,
    /// Oldest transaction still owed to the filesystem (tail sequence).
    pub oldest_tx: TxId,
    pub running: Option<TxId>,
    pub committing: Option<TxId>,
    /// Next free log block (journal-relative, wraps within the data area).
    pub head: u32,
    /// First log block of the oldest uncheckpointed transaction.
    pub tail: u32,
    /// Free log blocks (not reserved by handles, not holding live data).
    pub free: u32,
    /// Scalar bookkeeping for live transactions, keyed by raw tid.
    pub txns: HashMap<u32, TxRecord>,
    /// In-memory copy of the on-disk superblock.
    pub sb: Superblock,
}

/// Every transaction's buffer role lists plus the buffer side map, guarded
/// by the `lists` lock. Coarse on purpose: cross-list moves are atomic.
#[derive(Debug, Default)]
pub(crate) struct JournalLists {
    /// Side map from block number to journal bookkeeping.
    pub bufs: HashMap<u64, BufInfo>,
    /// Role lists per live transaction, keyed by raw tid.
    pub txs: HashMap<u32, TxLists>,
    /// Committed-but-uncheckpointed transactions, oldest first.
    pub checkpoint: VecDeque<u32>,
}

impl JournalLists {
    pub(crate) fn info_mut(&mut self, block: BlockNumber) -> &mut BufInfo {
        self.bufs.entry(block.0).or_insert_with(|| BufInfo::new(block))
    }

    /// Drop the side record if nothing refers to the buffer anymore.
    pub(crate) fn release_if_unlinked(&mut self, block: BlockNumber) {
        if let Some(info) = self.bufs.get(&block.0) {
            if !info.is_linked() {
                self.bufs.remove(&block.0);
            }
        }
    }
}

static NEXT_JOURNAL_ID: AtomicU64 = AtomicU64::new(1);

/// A write-ahead journal over a region of a block device.
///
/// One commit daemon thread per journal; every other entry point is called
/// from ordinary filesystem threads and may block. Call [`close`](Self::close)
/// for a clean shutdown — the daemon holds a reference to the journal, so
/// dropping the last user handle alone does not stop it.
pub struct Journal {
    pub(crate) cache: Arc<BufferCache>,
    pub(crate) mapper: Arc<dyn LogMapper>,
    pub(crate) config: JournalConfig,
    /// Total log blocks, including the superblock at log block 0.
    pub(crate) len: u32,
    /// First data block of the circular area (after the superblock).
    pub(crate) first: u32,
    pub(crate) block_size: BlockSize,
    /// Per-transaction credit cap.
    pub(crate) max_trans: u32,
    pub(crate) uuid: [u8; 16],
    /// Process-unique id, used to key thread-local handle slots.
    pub(crate) id: u64,
    pub(crate) state: Mutex<JournalState>,
    pub(crate) lists: Mutex<JournalLists>,
    pub(crate) revoke: RevokeTable,
    /// Wakes the commit daemon. Waits on `state`.
    pub(crate) commit_wake: Condvar,
    /// Broadcast when `commit_sequence` advances, a transaction unlocks, or
    /// a barrier clears. Waits on `state`.
    pub(crate) commit_done: Condvar,
    /// Broadcast when a transaction's user count reaches zero.
    pub(crate) users_drained: Condvar,
    pub(crate) daemon: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("block_size", &self.block_size.get())
            .finish_non_exhaustive()
    }
}

impl Journal {
    /// Construct a journal over `len` log blocks reached through `mapper`.
    ///
    /// Touches no device state; follow with [`create`](Self::create) for a
    /// fresh journal or [`load`](Self::load) for an existing one.
    pub fn new(
        cache: Arc<BufferCache>,
        mapper: Arc<dyn LogMapper>,
        len: u32,
        uuid: [u8; 16],
        config: JournalConfig,
    ) -> Result<Arc<Self>> {
        if len < MIN_LOG_BLOCKS {
            return Err(JotError::Invalid(format!(
                "journal too small: {len} blocks, need at least {MIN_LOG_BLOCKS}"
            )));
        }
        let block_size = cache.block_size();
        let first = 1_u32;
        let sb = Superblock {
            block_size: block_size.get(),
            first,
            sequence: TxId(1),
            start: 0,
            feature_compat: 0,
            feature_ro_compat: 0,
            feature_incompat: 0,
            uuid,
            user_count: 1,
            errno: 0,
        };
        Ok(Arc::new(Self {
            cache,
            mapper,
            config,
            len,
            first,
            block_size,
            max_trans: config.max_trans_blocks_for(len),
            uuid,
            id: NEXT_JOURNAL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(JournalState {
                loaded: false,
                aborted: false,
                errno: 0,
                barrier: 0,
                shutdown: false,
                next_tx: TxId(1),
                commit_sequence: TxId(0),
                commit_request: TxId(0),
                oldest_tx: TxId(1),
                running: None,
                committing: None,
                head: first,
                tail: first,
                free: len - first,
                txns: HashMap::new(),
                sb,
            }),
            lists: Mutex::new(JournalLists::default()),
            revoke: RevokeTable::new(),
            commit_wake: Condvar::new(),
            commit_done: Condvar::new(),
            users_drained: Condvar::new(),
            daemon: Mutex::new(None),
        }))
    }

    // -- log block I/O -----------------------------------------------------

    /// Map and synchronously write one journal-owned log block.
    pub(crate) fn write_log_block(&self, log_block: u32, data: &[u8]) -> Result<()> {
        let phys = self.mapper.map(LogBlock(log_block))?;
        let buf = self.cache.find_or_create(phys);
        buf.fill(data);
        self.cache.write_home(&buf)
    }

    /// Claim the next free log block, advancing the head cursor (wrapping
    /// past the superblock) and consuming one free block.
    pub(crate) fn next_log_block(&self) -> Result<u32> {
        let mut state = self.state.lock();
        if state.free == 0 {
            // The reserve withheld by log_free_space makes this unreachable
            // unless accounting is broken; abort rather than overwrite the
            // tail.
            drop(state);
            self.abort(libc::ENOSPC);
            return Err(JotError::NoSpace("log head caught up with tail".to_owned()));
        }
        let block = state.head;
        state.head += 1;
        if state.head >= self.len {
            state.head = self.first;
        }
        state.free -= 1;
        Ok(block)
    }

    /// Log blocks a caller may still reserve: free blocks minus the fixed
    /// reserve for commit-path control blocks, minus a 1/8 safety margin.
    pub(crate) fn log_free_space(state: &JournalState, config: &JournalConfig) -> u32 {
        let left = state.free.saturating_sub(config.min_reserved_blocks);
        left - (left >> 3)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Format the log region (zero every block, write a fresh superblock)
    /// and load the journal.
    pub fn create(self: &Arc<Self>) -> Result<()> {
        let zeros = vec![0_u8; self.block_size.as_usize()];
        for log_block in (self.first..self.len).rev() {
            self.write_log_block(log_block, &zeros)?;
        }
        let sb = {
            let state = self.state.lock();
            state.sb.clone()
        };
        let encoded = ondisk::encode_superblock(&sb, self.block_size.as_usize());
        self.write_log_block(0, &encoded)?;
        self.cache.sync()?;
        tracing::info!(
            target: "jot::journal",
            id = self.id,
            len = self.len,
            "journal_created"
        );
        self.load()
    }

    /// Read and validate the superblock, restore counters, and start the
    /// commit daemon. Refuses an unclean journal with
    /// [`JotError::NeedsRecovery`]; see [`wipe`](Self::wipe).
    pub fn load(self: &Arc<Self>) -> Result<()> {
        let sb = self.read_superblock()?;
        if sb.block_size != self.block_size.get() {
            return Err(JotError::Format(format!(
                "journal block size {} does not match device block size {}",
                sb.block_size,
                self.block_size.get()
            )));
        }
        if sb.first == 0 || sb.first >= self.len {
            return Err(JotError::Format(format!(
                "journal first block {} out of range (len {})",
                sb.first, self.len
            )));
        }
        if sb.feature_incompat != 0 {
            return Err(JotError::Format(format!(
                "unknown incompatible journal features: {:#010x}",
                sb.feature_incompat
            )));
        }
        if sb.start != 0 {
            return Err(JotError::NeedsRecovery);
        }

        {
            let mut state = self.state.lock();
            state.loaded = true;
            state.next_tx = sb.sequence;
            let previous = TxId(sb.sequence.0.wrapping_sub(1));
            state.commit_sequence = previous;
            state.commit_request = previous;
            state.oldest_tx = sb.sequence;
            state.head = sb.first;
            state.tail = sb.first;
            state.free = self.len - sb.first;
            if sb.errno != 0 {
                // A previous abort is sticky until recovery clears it.
                state.aborted = true;
                state.errno = sb.errno;
            }
            state.sb = sb;
        }
        commit::start_daemon(self)?;
        tracing::info!(target: "jot::journal", id = self.id, "journal_loaded");
        Ok(())
    }

    /// Whether the on-disk journal requires recovery before loading.
    pub fn needs_recovery(&self) -> Result<bool> {
        Ok(self.read_superblock()?.start != 0)
    }

    /// Discard an unclean journal's contents without replaying them: clears
    /// the in-use pointer and bumps the sequence past anything logged.
    /// Intended for "the filesystem was restored some other way" paths.
    pub fn wipe(&self) -> Result<()> {
        let mut sb = self.read_superblock()?;
        if sb.start == 0 {
            return Ok(());
        }
        tracing::warn!(
            target: "jot::journal",
            id = self.id,
            start = sb.start,
            sequence = sb.sequence.0,
            "journal_wipe_discarding_log"
        );
        sb.start = 0;
        sb.sequence = sb.sequence.next();
        self.write_superblock(&sb)?;
        self.state.lock().sb = sb;
        Ok(())
    }

    /// Force commit and checkpoint of everything, then mark the on-disk
    /// superblock clean. Zero I/O when the journal is already idle and
    /// clean.
    pub fn flush(self: &Arc<Self>) -> Result<()> {
        self.lock_updates();
        let result = self.flush_barriered();
        self.unlock_updates();
        result
    }

    fn flush_barriered(self: &Arc<Self>) -> Result<()> {
        // Force out the running transaction, then wait out whatever is
        // committing.
        let wait_target = {
            let mut state = self.state.lock();
            if let Some(tid) = state.running {
                if tid.after(state.commit_request) {
                    state.commit_request = tid;
                    self.commit_wake.notify_all();
                }
                Some(tid)
            } else {
                state.committing
            }
        };
        if let Some(tid) = wait_target {
            self.wait_for_commit(tid)?;
        }

        loop {
            if self.lists.lock().checkpoint.is_empty() {
                break;
            }
            checkpoint::checkpoint_pass(self)?;
        }

        let (sequence, errno, aborted) = {
            let state = self.state.lock();
            debug_assert!(state.running.is_none() && state.committing.is_none());
            (state.next_tx, state.errno, state.aborted)
        };
        if aborted {
            return Err(JotError::Aborted { errno });
        }
        // Clear the needs-recovery pointer.
        self.update_superblock(0, sequence, errno)?;
        tracing::debug!(target: "jot::journal", id = self.id, "journal_flushed");
        Ok(())
    }

    /// Clean shutdown: flush, stop the daemon, join it.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        let flush_result = self.flush();
        {
            let mut state = self.state.lock();
            state.shutdown = true;
        }
        self.commit_wake.notify_all();
        let handle = self.daemon.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| JotError::Invalid("commit daemon panicked".to_owned()))?;
        }
        tracing::info!(target: "jot::journal", id = self.id, "journal_closed");
        flush_result
    }

    // -- abort and error state ----------------------------------------------

    /// Abort the journal: all further `start` calls fail fast and the errno
    /// is persisted in the on-disk superblock for the next mount.
    pub fn abort(&self, errno: i32) {
        let sb = {
            let mut state = self.state.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.errno = errno;
            state.sb.errno = errno;
            state.sb.clone()
        };
        tracing::error!(target: "jot::journal", id = self.id, errno, "journal_aborted");
        // Best effort: the device may be the thing that failed.
        let _ = self.write_superblock(&sb);
        self.commit_done.notify_all();
        self.commit_wake.notify_all();
        self.users_drained.notify_all();
    }

    /// The sticky abort errno, if any.
    #[must_use]
    pub fn errno(&self) -> i32 {
        self.state.lock().errno
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Clear the sticky error after a successful external recovery (or an
    /// explicit wipe), persisting the cleared errno.
    pub fn clear_err(&self) -> Result<()> {
        let sb = {
            let mut state = self.state.lock();
            state.aborted = false;
            state.errno = 0;
            state.sb.errno = 0;
            state.sb.clone()
        };
        self.write_superblock(&sb)?;
        self.cache.sync()
    }

    // -- commit coordination -------------------------------------------------

    /// Ask the daemon to commit up to `tid`. Returns whether the request
    /// raised the commit target.
    pub fn request_commit(&self, tid: TxId) -> bool {
        let mut state = self.state.lock();
        if tid.after(state.commit_request) {
            state.commit_request = tid;
            drop(state);
            self.commit_wake.notify_all();
            tracing::trace!(target: "jot::journal", id = self.id, tid = tid.0, "commit_requested");
            true
        } else {
            false
        }
    }

    /// Block until `tid` is committed (its commit record is durable).
    pub fn wait_for_commit(&self, tid: TxId) -> Result<()> {
        let mut state = self.state.lock();
        while !state.commit_sequence.at_or_after(tid) {
            if state.aborted {
                return Err(JotError::Aborted { errno: state.errno });
            }
            self.commit_done.wait(&mut state);
        }
        Ok(())
    }

    /// Barrier: block new handles and wait for the running transaction's
    /// handles to drain. Pair with [`unlock_updates`](Self::unlock_updates).
    pub fn lock_updates(&self) {
        let mut state = self.state.lock();
        state.barrier += 1;
        while let Some(tid) = state.running {
            let users = state.txns.get(&tid.0).map_or(0, |rec| rec.users);
            if users == 0 {
                break;
            }
            self.users_drained.wait(&mut state);
        }
    }

    /// Release an update barrier.
    pub fn unlock_updates(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.barrier > 0);
        state.barrier -= 1;
        drop(state);
        self.commit_done.notify_all();
    }

    // -- superblock ----------------------------------------------------------

    fn read_superblock(&self) -> Result<Superblock> {
        let phys = self.mapper.map(LogBlock(0))?;
        let buf = self.cache.read(phys)?;
        buf.with_data(|data| ondisk::decode_superblock(data))
            .map_err(|e| JotError::Format(format!("journal superblock: {e}")))
    }

    fn write_superblock(&self, sb: &Superblock) -> Result<()> {
        let encoded = ondisk::encode_superblock(sb, self.block_size.as_usize());
        self.write_log_block(0, &encoded)?;
        self.cache.sync()
    }

    /// Persist the superblock pointers if they changed. Zero I/O when the
    /// on-disk copy already matches.
    pub(crate) fn update_superblock(&self, start: u32, sequence: TxId, errno: i32) -> Result<()> {
        let sb = {
            let mut state = self.state.lock();
            if state.sb.start == start
                && state.sb.sequence == sequence
                && state.sb.errno == errno
            {
                return Ok(());
            }
            state.sb.start = start;
            state.sb.sequence = sequence;
            state.sb.errno = errno;
            state.sb.clone()
        };
        tracing::debug!(
            target: "jot::journal",
            id = self.id,
            start,
            sequence = sequence.0,
            errno,
            "superblock_update"
        );
        self.write_superblock(&sb)
    }

    // -- introspection (primarily for tests and the filesystem layer) --------

    /// Free log blocks currently available to reserve.
    #[must_use]
    pub fn free_blocks(&self) -> u32 {
        self.state.lock().free
    }

    /// The per-transaction credit cap.
    #[must_use]
    pub fn max_trans_blocks(&self) -> u32 {
        self.max_trans
    }

    /// Id of the most recently committed transaction.
    #[must_use]
    pub fn committed_tid(&self) -> TxId {
        self.state.lock().commit_sequence
    }

    /// Number of committed-but-uncheckpointed transactions.
    #[must_use]
    pub fn checkpoint_backlog(&self) -> usize {
        self.lists.lock().checkpoint.len()
    }

    /// Run `f` over the undo copy captured by
    /// [`get_undo_access`](crate::Handle::get_undo_access): the content the
    /// pending commit will make visible on disk. Allocators consult this to
    /// avoid reusing blocks the committed state still considers taken.
    /// `None` when no undo copy is held for `block`.
    pub fn with_committed_data<R>(
        &self,
        block: BlockNumber,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Option<R> {
        let lists = self.lists.lock();
        lists
            .bufs
            .get(&block.0)
            .and_then(|info| info.committed_data.as_deref())
            .map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jot_block::MemBlockDevice;

    fn test_cache(len: u32) -> Arc<BufferCache> {
        let bs = BlockSize::new(1024).expect("block size");
        let device = Arc::new(MemBlockDevice::new(bs, u64::from(len) + 8));
        Arc::new(BufferCache::new(device))
    }

    fn journal_over(cache: Arc<BufferCache>, len: u32) -> Arc<Journal> {
        Journal::new(
            cache,
            Arc::new(LinearMapper::new(BlockNumber(4))),
            len,
            [7_u8; 16],
            JournalConfig::default(),
        )
        .expect("journal")
    }

    fn test_journal(len: u32) -> Arc<Journal> {
        journal_over(test_cache(len), len)
    }

    #[test]
    fn create_then_reload() {
        let cache = test_cache(64);
        let journal = journal_over(Arc::clone(&cache), 64);
        journal.create().expect("create");
        assert!(!journal.needs_recovery().expect("check"));
        journal.close().expect("close");

        // A second journal object over the same region loads cleanly.
        let reopened = journal_over(cache, 64);
        reopened.load().expect("load");
        reopened.close().expect("close");
    }

    #[test]
    fn rejects_tiny_journal() {
        let bs = BlockSize::new(1024).expect("bs");
        let device = Arc::new(MemBlockDevice::new(bs, 64));
        let cache = Arc::new(BufferCache::new(device));
        let result = Journal::new(
            cache,
            Arc::new(LinearMapper::new(BlockNumber(0))),
            4,
            [0; 16],
            JournalConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn load_rejects_unclean_journal() {
        let cache = test_cache(64);
        let journal = journal_over(Arc::clone(&cache), 64);
        journal.create().expect("create");
        journal.close().expect("close");

        // Simulate a crash mid-commit: force the on-disk start pointer.
        let mut sb = journal.read_superblock().expect("sb");
        sb.start = 5;
        journal.write_superblock(&sb).expect("write");

        let reopened = journal_over(Arc::clone(&cache), 64);
        assert!(matches!(reopened.load(), Err(JotError::NeedsRecovery)));
        assert!(reopened.needs_recovery().expect("check"));

        reopened.wipe().expect("wipe");
        assert!(!reopened.needs_recovery().expect("check"));
        reopened.load().expect("load after wipe");
        reopened.close().expect("close");
    }

    #[test]
    fn abort_persists_errno() {
        let journal = test_journal(64);
        journal.create().expect("create");
        journal.abort(libc::EIO);
        assert!(journal.is_aborted());
        assert_eq!(journal.errno(), libc::EIO);

        let sb = journal.read_superblock().expect("sb");
        assert_eq!(sb.errno, libc::EIO);

        journal.clear_err().expect("clear");
        assert!(!journal.is_aborted());
        assert_eq!(journal.read_superblock().expect("sb").errno, 0);
        journal.close().expect("close");
    }

    #[test]
    fn log_free_space_withholds_reserve_and_margin() {
        let config = JournalConfig {
            min_reserved_blocks: 32,
            ..JournalConfig::default()
        };
        let journal = test_journal(64);
        let state = journal.state.lock();
        // free = 63; (63 - 32) = 31; 31 - 3 = 28.
        assert_eq!(Journal::log_free_space(&state, &config), 28);
    }

    #[test]
    fn next_log_block_wraps_past_superblock() {
        let journal = test_journal(64);
        {
            let mut state = journal.state.lock();
            state.head = 63;
            state.free = 10;
        }
        assert_eq!(journal.next_log_block().expect("block"), 63);
        assert_eq!(journal.next_log_block().expect("block"), 1);
        assert_eq!(journal.state.lock().free, 8);
    }

    #[test]
    fn linear_mapper_offsets() {
        let mapper = LinearMapper::new(BlockNumber(100));
        assert_eq!(mapper.map(LogBlock(0)).expect("map"), BlockNumber(100));
        assert_eq!(mapper.map(LogBlock(63)).expect("map"), BlockNumber(163));
        assert!(LinearMapper::new(BlockNumber(u64::MAX))
            .map(LogBlock(1))
            .is_err());
    }
}
