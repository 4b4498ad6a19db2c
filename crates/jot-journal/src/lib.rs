#![forbid(unsafe_code)]
//! Write-ahead journaling core for block filesystems.
//!
//! Batches metadata (and optionally data) changes into transactions, writes
//! them to a circular on-device log, later checkpoints them into their home
//! locations, and exposes a transactional [`Handle`] API to filesystem code.
//!
//! The moving parts:
//!
//! - [`Journal`] owns the log geometry, the superblock, the transaction
//!   table, and the buffer side records.
//! - [`Handle`] is a caller's ticket into the running transaction, with a
//!   block-credit budget. Handles are reentrant within a thread.
//! - A single commit daemon per journal freezes the running transaction,
//!   escapes and writes log blocks, writes the commit record, and hands
//!   pending buffers to the next transaction.
//! - Checkpointing applies committed transactions to their home blocks and
//!   reclaims log space.
//! - The revoke table prevents replay of stale log records during recovery.
//!
//! Lock order (outer to inner): buffer I/O lock → `lists` → `state`. The
//! `state` mutex guards journal-wide scalars and per-transaction counters;
//! the `lists` mutex guards every transaction's buffer role lists plus the
//! buffer side map, so cross-list moves are atomic. Neither is ever held
//! across device I/O.

pub mod bufinfo;
pub mod checkpoint;
pub mod commit;
pub mod config;
pub mod handle;
pub mod journal;
pub mod ondisk;
pub mod revoke;
pub mod transaction;

pub use config::JournalConfig;
pub use handle::Handle;
pub use journal::{Journal, LinearMapper, LogMapper};
pub use transaction::TxState;
