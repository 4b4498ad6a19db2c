#![forbid(unsafe_code)]
//! Error types for the jot journaling core.
//!
//! # Error Taxonomy
//!
//! jot uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `jot-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `JotError` | `jot-error` (this crate) | Errors surfaced to the filesystem layer |
//!
//! `jot-error` is intentionally independent of `jot-types` to avoid cyclic
//! dependencies; `jot-journal` converts `ParseError` into `JotError::Format`
//! or `JotError::Corruption` at its boundary (`Format` when the journal
//! superblock is structurally wrong at load time, `Corruption` when a live
//! log block fails validation).
//!
//! # errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`JotError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned. The filesystem layer typically
//! reacts to `ReadOnly`/`Aborted` by remounting read-only rather than
//! panicking — nothing here is meant to crash the caller.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | `EIO` |
//! | `Aborted` | `EROFS` |
//! | `ReadOnly` | `EROFS` |
//! | `NoSpace` | `ENOSPC` |
//! | `Invalid` | `EINVAL` |
//! | `Format` | `EINVAL` |
//! | `Corruption` | `EIO` |
//! | `Retry` | `EAGAIN` |
//! | `NeedsRecovery` | `EUCLEAN` |

use thiserror::Error;

/// Unified error type for all jot operations.
#[derive(Debug, Error)]
pub enum JotError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The journal has been aborted; all further updates fail fast.
    ///
    /// Carries the errno recorded in the on-disk superblock so the next
    /// mount or fsck can see why.
    #[error("journal aborted (errno {errno})")]
    Aborted { errno: i32 },

    /// A write was attempted with no journal, or against a read-only device.
    #[error("read-only: journal unavailable for updates")]
    ReadOnly,

    /// Credit reservation exceeds the per-transaction maximum or the log
    /// cannot satisfy the request.
    #[error("no log space: {0}")]
    NoSpace(String),

    /// Caller misuse (bad handle state, geometry out of range, ...).
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Structurally invalid on-disk journal format.
    #[error("invalid journal format: {0}")]
    Format(String),

    /// A journal-owned block failed validation while the journal is live.
    #[error("corrupt journal block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Transient cross-transaction race; the caller must retry its
    /// read-branch path.
    #[error("transient conflict, retry")]
    Retry,

    /// The on-disk journal is unclean and must be recovered (or wiped)
    /// before it can be loaded.
    #[error("journal needs recovery")]
    NeedsRecovery,
}

impl JotError {
    /// Convert this error into a POSIX errno for the filesystem layer.
    ///
    /// Exhaustive by design: a new variant without an errno is a compile
    /// error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Aborted { .. } | Self::ReadOnly => libc::EROFS,
            Self::NoSpace(_) => libc::ENOSPC,
            Self::Invalid(_) | Self::Format(_) => libc::EINVAL,
            Self::Corruption { .. } => libc::EIO,
            Self::Retry => libc::EAGAIN,
            Self::NeedsRecovery => libc::EUCLEAN,
        }
    }
}

/// Result alias using `JotError`.
pub type Result<T> = std::result::Result<T, JotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(JotError, libc::c_int)> = vec![
            (JotError::Io(std::io::Error::other("test")), libc::EIO),
            (JotError::Aborted { errno: libc::EIO }, libc::EROFS),
            (JotError::ReadOnly, libc::EROFS),
            (JotError::NoSpace("10 > 8".into()), libc::ENOSPC),
            (JotError::Invalid("credits=0".into()), libc::EINVAL),
            (JotError::Format("bad magic".into()), libc::EINVAL),
            (
                JotError::Corruption {
                    block: 3,
                    detail: "crc".into(),
                },
                libc::EIO,
            ),
            (JotError::Retry, libc::EAGAIN),
            (JotError::NeedsRecovery, libc::EUCLEAN),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(JotError::Io(raw).to_errno(), libc::ENOSPC);
    }

    #[test]
    fn display_formatting() {
        let err = JotError::Aborted { errno: 5 };
        assert_eq!(err.to_string(), "journal aborted (errno 5)");

        let ns = JotError::NoSpace("requested 100, max 64".into());
        assert!(ns.to_string().contains("no log space"));
    }
}
