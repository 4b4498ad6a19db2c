#![forbid(unsafe_code)]
//! Shared newtypes for the jot journaling core.
//!
//! Everything here is a unit-carrying wrapper: the point is to make it a
//! compile error to hand a device block number to an API expecting a log
//! offset, or a transaction id to something expecting a credit count.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Device-absolute block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Journal-relative log block index (offset within the log region).
///
/// The on-disk journal format addresses log blocks with 32 bits, so this is
/// deliberately narrower than [`BlockNumber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogBlock(pub u32);

/// Transaction id.
///
/// Tids are 32-bit and wrap. Ordering uses signed-difference semantics,
/// valid for deltas within ±2^31: `TxId(5).after(TxId(u32::MAX))` is true.
/// Never compare tids with `<`/`>` directly; `PartialOrd` is intentionally
/// not derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub u32);

impl TxId {
    /// `self` was created strictly after `other` (wraparound-safe).
    #[must_use]
    pub fn after(self, other: TxId) -> bool {
        self.0.wrapping_sub(other.0) as i32 > 0
    }

    /// `self` was created at the same time as or after `other`.
    #[must_use]
    pub fn at_or_after(self, other: TxId) -> bool {
        self.0.wrapping_sub(other.0) as i32 >= 0
    }

    /// The next tid in sequence.
    #[must_use]
    pub fn next(self) -> TxId {
        TxId(self.0.wrapping_add(1))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a usize (always fits: max is 65536).
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Convert a block number to its byte offset on the device.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }
}

/// Errors produced while parsing on-disk structures.
///
/// These are crate-internal: the journal converts them into the user-facing
/// error type at its API boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Not enough bytes to parse the structure.
    #[error("insufficient data: need {need} bytes at offset {offset}, got {got}")]
    InsufficientData {
        need: usize,
        offset: usize,
        got: usize,
    },

    /// A magic number did not match.
    #[error("invalid magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidMagic { expected: u32, got: u32 },

    /// A field value is structurally invalid.
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },

    /// An arithmetic conversion overflowed while interpreting parsed values.
    #[error("integer conversion failed for {field}")]
    IntegerConversion { field: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_ordering_simple() {
        assert!(TxId(2).after(TxId(1)));
        assert!(!TxId(1).after(TxId(2)));
        assert!(!TxId(1).after(TxId(1)));
        assert!(TxId(1).at_or_after(TxId(1)));
    }

    #[test]
    fn tid_ordering_wraps() {
        // A tid just past the wrap point is newer than one just before it.
        assert!(TxId(5).after(TxId(u32::MAX)));
        assert!(TxId(0).after(TxId(u32::MAX)));
        assert!(!TxId(u32::MAX).after(TxId(5)));
        assert!(TxId(5).at_or_after(TxId(u32::MAX - 3)));
    }

    #[test]
    fn tid_ordering_valid_within_half_range() {
        let base = TxId(0x8000_0000);
        assert!(TxId(0x8000_0000_u32.wrapping_add(0x7FFF_FFFF)).after(base));
        assert!(base.after(TxId(0x0000_0001)));
    }

    #[test]
    fn tid_next_wraps() {
        assert_eq!(TxId(u32::MAX).next(), TxId(0));
        assert_eq!(TxId(7).next(), TxId(8));
    }

    #[test]
    fn block_size_accepts_powers_of_two() {
        for bits in [512_u32, 1024, 4096, 65536] {
            let bs = BlockSize::new(bits).expect("valid block size");
            assert_eq!(bs.get(), bits);
        }
    }

    #[test]
    fn block_size_rejects_invalid() {
        assert!(BlockSize::new(0).is_err());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(256).is_err());
        assert!(BlockSize::new(131_072).is_err());
    }

    #[test]
    fn block_to_byte_checked() {
        let bs = BlockSize::new(4096).expect("valid");
        assert_eq!(bs.block_to_byte(BlockNumber(2)), Some(8192));
        assert_eq!(bs.block_to_byte(BlockNumber(u64::MAX)), None);
    }
}
