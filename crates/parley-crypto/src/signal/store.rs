use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;
use crate::signal::prekeys::{OneTimePreKey, SignedPreKey};

/// Identifies one session: a local device talking to one remote device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionAddress {
    pub local_device_id: String,
    pub remote_user_id: String,
    pub remote_device_id: String,
}

impl SessionAddress {
    pub fn new(
        local_device_id: impl Into<String>,
        remote_user_id: impl Into<String>,
        remote_device_id: impl Into<String>,
    ) -> Self {
        Self {
            local_device_id: local_device_id.into(),
            remote_user_id: remote_user_id.into(),
            remote_device_id: remote_device_id.into(),
        }
    }
}

impl fmt::Display for SessionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}.{}",
            self.local_device_id, self.remote_user_id, self.remote_device_id
        )
    }
}

/// Storage for the local identity and the remote identities seen so far.
///
/// Remote identity keys follow Trust On First Use: the first key seen for a
/// remote device is pinned, and a different key later is untrusted.
pub trait IdentityKeyStore: Send + Sync {
    /// Our own identity key pair.
    fn identity_key_pair(&self) -> Result<IdentityKeyPair, CryptoError>;

    /// Whether `identity_key` may be used for this remote device.
    fn is_trusted_identity(
        &self,
        remote_user_id: &str,
        remote_device_id: &str,
        identity_key: &[u8; 32],
    ) -> Result<bool, CryptoError>;

    /// Pin (or re-pin, after the user has verified it) a remote identity key.
    fn save_identity(
        &self,
        remote_user_id: &str,
        remote_device_id: &str,
        identity_key: &[u8; 32],
    ) -> Result<(), CryptoError>;
}

/// Storage for our own prekeys.
///
/// One-time prekeys are removed once a session has consumed them.
pub trait PreKeyStore: Send + Sync {
    fn load_one_time_pre_key(&self, key_id: u32) -> Result<Option<OneTimePreKey>, CryptoError>;

    fn store_one_time_pre_key(&self, pre_key: OneTimePreKey) -> Result<(), CryptoError>;

    fn remove_one_time_pre_key(&self, key_id: u32) -> Result<(), CryptoError>;

    fn load_signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKey>, CryptoError>;

    fn store_signed_pre_key(&self, pre_key: SignedPreKey) -> Result<(), CryptoError>;

    /// Drop a rotated-out signed prekey.
    fn remove_signed_pre_key(&self, key_id: u32) -> Result<(), CryptoError>;
}

/// Storage for serialized session state (see `SessionState::serialize`).
pub trait SessionStore: Send + Sync {
    fn load_session(&self, address: &SessionAddress) -> Result<Option<Vec<u8>>, CryptoError>;

    fn store_session(&self, address: &SessionAddress, session_data: &[u8])
        -> Result<(), CryptoError>;

    fn has_session(&self, address: &SessionAddress) -> Result<bool, CryptoError>;

    /// Delete a session (conversation reset, device unlink).
    fn delete_session(&self, address: &SessionAddress) -> Result<(), CryptoError>;

    fn list_sessions(&self) -> Result<Vec<SessionAddress>, CryptoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display() {
        let address = SessionAddress::new("laptop", "bob", "phone");
        assert_eq!(address.to_string(), "laptop->bob.phone");
    }
}
