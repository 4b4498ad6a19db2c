#![forbid(unsafe_code)]
//! Block I/O traits and the buffer cache the journal core runs against.
//!
//! Provides the [`ByteDevice`] / [`BlockDevice`] traits, a file-backed
//! device using `pread`/`pwrite` semantics, an in-memory device for tests,
//! and [`BufferCache`]: a map of reference-counted [`Buffer`] heads with
//! lock / dirty / uptodate state and synchronous submission.
//!
//! The journal attaches its own side records to buffers by block number; it
//! never stores state inside this crate. Buffer reference counting is the
//! `Arc` the cache hands out.

use jot_error::{JotError, Result};
use jot_types::{BlockNumber, BlockSize};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(u64::try_from(buf.len()).map_err(|_| {
                JotError::Invalid("read length overflows u64".to_owned())
            })?)
            .ok_or_else(|| JotError::Invalid("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(JotError::Invalid(format!(
                "read out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(JotError::ReadOnly);
        }
        let end = offset
            .checked_add(u64::try_from(buf.len()).map_err(|_| {
                JotError::Invalid("write length overflows u64".to_owned())
            })?)
            .ok_or_else(|| JotError::Invalid("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(JotError::Invalid(format!(
                "write out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number into `buf`. `buf.len()` MUST equal `block_size()`.
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> BlockSize;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Adapter exposing a [`ByteDevice`] as a [`BlockDevice`].
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: BlockSize,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: BlockSize) -> Result<Self> {
        let len = inner.len_bytes();
        let bs = u64::from(block_size.get());
        if len % bs != 0 {
            return Err(JotError::Invalid(format!(
                "device length is not block-aligned: len_bytes={len} block_size={}",
                block_size.get()
            )));
        }
        Ok(Self {
            inner,
            block_size,
            block_count: len / bs,
        })
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(JotError::Invalid(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        self.block_size
            .block_to_byte(block)
            .ok_or_else(|| JotError::Invalid("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.block_size.as_usize() {
            return Err(JotError::Invalid(format!(
                "read_block buffer size mismatch: got={} expected={}",
                buf.len(),
                self.block_size.get()
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner.read_exact_at(offset, buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size.as_usize() {
            return Err(JotError::Invalid(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size.get()
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// In-memory block device for tests and for hosting throwaway journals.
#[derive(Debug)]
pub struct MemBlockDevice {
    blocks: Mutex<Vec<u8>>,
    block_size: BlockSize,
    block_count: u64,
}

impl MemBlockDevice {
    /// Create a zero-filled device of `block_count` blocks.
    #[must_use]
    pub fn new(block_size: BlockSize, block_count: u64) -> Self {
        let len = block_size.as_usize() * usize::try_from(block_count).unwrap_or(0);
        Self {
            blocks: Mutex::new(vec![0_u8; len]),
            block_size,
            block_count,
        }
    }

    fn range_of(&self, block: BlockNumber) -> Result<std::ops::Range<usize>> {
        if block.0 >= self.block_count {
            return Err(JotError::Invalid(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        let bs = self.block_size.as_usize();
        let start = usize::try_from(block.0)
            .map_err(|_| JotError::Invalid("block does not fit usize".to_owned()))?
            * bs;
        Ok(start..start + bs)
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        let range = self.range_of(block)?;
        if buf.len() != self.block_size.as_usize() {
            return Err(JotError::Invalid("read_block size mismatch".to_owned()));
        }
        buf.copy_from_slice(&self.blocks.lock()[range]);
        Ok(())
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let range = self.range_of(block)?;
        if data.len() != self.block_size.as_usize() {
            return Err(JotError::Invalid("write_block size mismatch".to_owned()));
        }
        self.blocks.lock()[range].copy_from_slice(data);
        Ok(())
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Buffer heads
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BufState {
    data: Vec<u8>,
    /// Content reflects the device (or a newer in-memory version).
    uptodate: bool,
    /// Generic cache dirty bit. The journal keeps its own, separate dirty
    /// bit in its side record so ordinary writeback never races an in-flight
    /// journal write of the same block.
    dirty: bool,
    /// Exclusive I/O lock.
    locked: bool,
}

/// A cached block buffer.
///
/// Reference counting is the `Arc<Buffer>` the cache hands out; a buffer is
/// evictable once the cache holds the only reference.
#[derive(Debug)]
pub struct Buffer {
    block: BlockNumber,
    state: Mutex<BufState>,
    unlocked: Condvar,
}

impl Buffer {
    fn new(block: BlockNumber, size: usize) -> Self {
        Self {
            block,
            state: Mutex::new(BufState {
                data: vec![0_u8; size],
                uptodate: false,
                dirty: false,
                locked: false,
            }),
            unlocked: Condvar::new(),
        }
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Acquire the exclusive I/O lock, blocking until available.
    pub fn lock(&self) {
        let mut state = self.state.lock();
        while state.locked {
            self.unlocked.wait(&mut state);
        }
        state.locked = true;
    }

    /// Release the exclusive I/O lock.
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        state.locked = false;
        drop(state);
        self.unlocked.notify_all();
    }

    /// Block until the buffer is not I/O-locked (without acquiring the lock).
    pub fn wait_until_unlocked(&self) {
        let mut state = self.state.lock();
        while state.locked {
            self.unlocked.wait(&mut state);
        }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }

    pub fn clear_dirty(&self) {
        self.state.lock().dirty = false;
    }

    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.state.lock().uptodate
    }

    pub fn mark_uptodate(&self) {
        self.state.lock().uptodate = true;
    }

    /// Copy out the current content.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    /// Run `f` over the current content.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.state.lock().data)
    }

    /// Run `f` over the content mutably. Marks the buffer uptodate (the
    /// caller is producing the newest version).
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.state.lock();
        state.uptodate = true;
        f(&mut state.data)
    }

    /// Replace the content wholesale.
    pub fn fill(&self, data: &[u8]) {
        let mut state = self.state.lock();
        state.data.copy_from_slice(data);
        state.uptodate = true;
    }
}

// ---------------------------------------------------------------------------
// Buffer cache
// ---------------------------------------------------------------------------

/// Map of live buffers keyed by block number, backed by a [`BlockDevice`].
///
/// This is deliberately simple: unbounded, with explicit eviction of
/// unreferenced buffers via [`evict_unused`](Self::evict_unused). The
/// journal core only needs identity (one `Buffer` per block), dirty
/// tracking, and synchronous submission.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    buffers: Mutex<HashMap<BlockNumber, Arc<Buffer>>>,
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("buffers", &self.buffers.lock().len())
            .finish_non_exhaustive()
    }
}

impl BufferCache {
    #[must_use]
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.device.block_size()
    }

    /// Get or create the buffer for `block` without reading the device
    /// (`getblk` semantics — for blocks about to be fully overwritten).
    #[must_use]
    pub fn find_or_create(&self, block: BlockNumber) -> Arc<Buffer> {
        let mut buffers = self.buffers.lock();
        Arc::clone(buffers.entry(block).or_insert_with(|| {
            Arc::new(Buffer::new(block, self.device.block_size().as_usize()))
        }))
    }

    /// Get the buffer for `block`, reading it from the device if the cached
    /// copy is not uptodate.
    pub fn read(&self, block: BlockNumber) -> Result<Arc<Buffer>> {
        let buf = self.find_or_create(block);
        if !buf.is_uptodate() {
            buf.lock();
            // Re-check under the I/O lock; another thread may have read it.
            if !buf.is_uptodate() {
                let mut data = vec![0_u8; self.device.block_size().as_usize()];
                if let Err(e) = self.device.read_block(block, &mut data) {
                    buf.unlock();
                    return Err(e);
                }
                buf.fill(&data);
            }
            buf.unlock();
        }
        Ok(buf)
    }

    /// Synchronously write the buffer's content to its home location and
    /// clear the generic dirty bit.
    pub fn write_home(&self, buf: &Buffer) -> Result<()> {
        buf.lock();
        let result = self.write_home_locked(buf);
        buf.unlock();
        result
    }

    /// [`write_home`](Self::write_home) for a caller that already holds the
    /// buffer's I/O lock (the lock is not reentrant).
    pub fn write_home_locked(&self, buf: &Buffer) -> Result<()> {
        let data = buf.snapshot();
        let result = self.device.write_block(buf.block(), &data);
        if result.is_ok() {
            buf.clear_dirty();
        }
        tracing::trace!(
            target: "jot::block",
            block = buf.block().0,
            ok = result.is_ok(),
            "buffer_write_home"
        );
        result
    }

    /// Flush the device.
    pub fn sync(&self) -> Result<()> {
        self.device.sync()
    }

    /// Drop buffers no longer referenced outside the cache. Returns the
    /// number evicted. Dirty buffers are kept.
    pub fn evict_unused(&self) -> usize {
        let mut buffers = self.buffers.lock();
        let before = buffers.len();
        buffers.retain(|_, buf| Arc::strong_count(buf) > 1 || buf.is_dirty());
        before - buffers.len()
    }
}
