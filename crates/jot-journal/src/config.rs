//! Journal tunables.

use std::time::Duration;

/// Configuration for a [`crate::Journal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalConfig {
    /// How long a transaction may accumulate updates before the daemon
    /// commits it. Default: 5s.
    pub commit_interval: Duration,
    /// Maximum credits one transaction may reserve. `0` means "a quarter of
    /// the log length", computed when the journal loads.
    pub max_trans_blocks: u32,
    /// Log blocks withheld from callers so the commit path can always write
    /// its own descriptor/commit/revoke blocks. Default: 32.
    pub min_reserved_blocks: u32,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            commit_interval: Duration::from_secs(5),
            max_trans_blocks: 0,
            min_reserved_blocks: 32,
        }
    }
}

impl JournalConfig {
    /// Resolve the per-transaction credit cap for a log of `len` blocks.
    #[must_use]
    pub fn max_trans_blocks_for(&self, len: u32) -> u32 {
        if self.max_trans_blocks == 0 {
            (len / 4).max(1)
        } else {
            self.max_trans_blocks
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cap_is_quarter_of_log() {
        let config = JournalConfig::default();
        assert_eq!(config.max_trans_blocks_for(1024), 256);
        assert_eq!(config.max_trans_blocks_for(2), 1);
    }

    #[test]
    fn explicit_cap_wins() {
        let config = JournalConfig {
            max_trans_blocks: 64,
            ..JournalConfig::default()
        };
        assert_eq!(config.max_trans_blocks_for(1024), 64);
    }
}
