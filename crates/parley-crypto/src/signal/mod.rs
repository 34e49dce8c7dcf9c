pub mod codec;
pub mod engine;
pub mod manager;
pub mod memory_stores;
pub mod prekeys;
pub mod state;
pub mod store;
#[cfg(test)]
mod test_support;

use std::time::{SystemTime, UNIX_EPOCH};

pub use engine::{DecryptedMessage, EncryptedMessage, SignalProtocolEngine, X3dhInitiation};
pub use manager::{Envelope, LocalDevice, SessionManager};
pub use memory_stores::{MemoryIdentityStore, MemoryPreKeyStore, MemorySessionStore};
pub use prekeys::{
    InitialMessage, OneTimePreKey, OneTimePreKeyPublic, PreKeyBundle, SignedPreKey,
    SignedPreKeyPublic,
};
pub use state::{MessageHeader, PreviousChain, SessionState, SkippedKeyId, SkippedMessageKeys};
pub use store::{IdentityKeyStore, PreKeyStore, SessionAddress, SessionStore};

/// Current time in unix milliseconds. A clock before the epoch reads as 0.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
