use serde::{Deserialize, Serialize};

/// Limits applied by the Double Ratchet when messages arrive out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatchetConfig {
    /// Largest message-number gap accepted in a single receiving chain.
    ///
    /// A header that claims a bigger jump is rejected without touching the
    /// session, so a peer cannot force unbounded key derivation.
    pub max_skip: u32,
    /// Total number of skipped message keys kept per session. The oldest
    /// entries are evicted first.
    pub max_skipped_keys: usize,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_skipped_keys: 2000,
        }
    }
}
