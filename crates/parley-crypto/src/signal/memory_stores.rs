//! In-memory implementations of the storage traits.
//!
//! Data is lost on process exit. Hosts with durable storage implement the
//! traits themselves; these back tests and short-lived tools.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;
use crate::signal::prekeys::{OneTimePreKey, SignedPreKey};
use crate::signal::store::{IdentityKeyStore, PreKeyStore, SessionAddress, SessionStore};

/// In-memory identity key store with Trust On First Use.
pub struct MemoryIdentityStore {
    identity: IdentityKeyPair,
    trusted: Mutex<HashMap<(String, String), [u8; 32]>>,
}

impl MemoryIdentityStore {
    pub fn new(identity: IdentityKeyPair) -> Self {
        Self {
            identity,
            trusted: Mutex::new(HashMap::new()),
        }
    }
}

impl IdentityKeyStore for MemoryIdentityStore {
    fn identity_key_pair(&self) -> Result<IdentityKeyPair, CryptoError> {
        Ok(self.identity.clone())
    }

    fn is_trusted_identity(
        &self,
        remote_user_id: &str,
        remote_device_id: &str,
        identity_key: &[u8; 32],
    ) -> Result<bool, CryptoError> {
        let trusted = self.trusted.lock();
        match trusted.get(&(remote_user_id.to_owned(), remote_device_id.to_owned())) {
            Some(pinned) => Ok(pinned == identity_key),
            None => Ok(true),
        }
    }

    fn save_identity(
        &self,
        remote_user_id: &str,
        remote_device_id: &str,
        identity_key: &[u8; 32],
    ) -> Result<(), CryptoError> {
        self.trusted.lock().insert(
            (remote_user_id.to_owned(), remote_device_id.to_owned()),
            *identity_key,
        );
        Ok(())
    }
}

/// In-memory prekey store.
#[derive(Default)]
pub struct MemoryPreKeyStore {
    one_time_pre_keys: Mutex<HashMap<u32, OneTimePreKey>>,
    signed_pre_keys: Mutex<HashMap<u32, SignedPreKey>>,
}

impl MemoryPreKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of one-time prekeys left to hand out.
    pub fn one_time_pre_key_count(&self) -> usize {
        self.one_time_pre_keys.lock().len()
    }
}

impl PreKeyStore for MemoryPreKeyStore {
    fn load_one_time_pre_key(&self, key_id: u32) -> Result<Option<OneTimePreKey>, CryptoError> {
        Ok(self.one_time_pre_keys.lock().get(&key_id).cloned())
    }

    fn store_one_time_pre_key(&self, pre_key: OneTimePreKey) -> Result<(), CryptoError> {
        self.one_time_pre_keys.lock().insert(pre_key.key_id(), pre_key);
        Ok(())
    }

    fn remove_one_time_pre_key(&self, key_id: u32) -> Result<(), CryptoError> {
        self.one_time_pre_keys.lock().remove(&key_id);
        Ok(())
    }

    fn load_signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKey>, CryptoError> {
        Ok(self.signed_pre_keys.lock().get(&key_id).cloned())
    }

    fn store_signed_pre_key(&self, pre_key: SignedPreKey) -> Result<(), CryptoError> {
        self.signed_pre_keys.lock().insert(pre_key.key_id(), pre_key);
        Ok(())
    }

    fn remove_signed_pre_key(&self, key_id: u32) -> Result<(), CryptoError> {
        self.signed_pre_keys.lock().remove(&key_id);
        Ok(())
    }
}

/// In-memory session store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionAddress, Vec<u8>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load_session(&self, address: &SessionAddress) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.sessions.lock().get(address).cloned())
    }

    fn store_session(
        &self,
        address: &SessionAddress,
        session_data: &[u8],
    ) -> Result<(), CryptoError> {
        self.sessions
            .lock()
            .insert(address.clone(), session_data.to_vec());
        Ok(())
    }

    fn has_session(&self, address: &SessionAddress) -> Result<bool, CryptoError> {
        Ok(self.sessions.lock().contains_key(address))
    }

    fn delete_session(&self, address: &SessionAddress) -> Result<(), CryptoError> {
        self.sessions.lock().remove(address);
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<SessionAddress>, CryptoError> {
        let mut addresses: Vec<SessionAddress> = self.sessions.lock().keys().cloned().collect();
        addresses.sort();
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::RustCryptoProvider;

    #[test]
    fn identity_store_pins_first_key() {
        let provider = RustCryptoProvider;
        let store = MemoryIdentityStore::new(IdentityKeyPair::generate(&provider).unwrap());

        let first = [1u8; 32];
        let second = [2u8; 32];
        assert!(store.is_trusted_identity("bob", "phone", &first).unwrap());
        store.save_identity("bob", "phone", &first).unwrap();

        assert!(store.is_trusted_identity("bob", "phone", &first).unwrap());
        assert!(!store.is_trusted_identity("bob", "phone", &second).unwrap());
        assert!(store.is_trusted_identity("bob", "laptop", &second).unwrap());
    }

    #[test]
    fn prekey_store_removes_consumed_keys() {
        let provider = RustCryptoProvider;
        let store = MemoryPreKeyStore::new();
        for key in OneTimePreKey::generate_batch(&provider, 1, 3).unwrap() {
            store.store_one_time_pre_key(key).unwrap();
        }

        assert_eq!(store.one_time_pre_key_count(), 3);
        assert!(store.load_one_time_pre_key(2).unwrap().is_some());
        store.remove_one_time_pre_key(2).unwrap();
        assert!(store.load_one_time_pre_key(2).unwrap().is_none());
        assert_eq!(store.one_time_pre_key_count(), 2);
    }

    #[test]
    fn session_store_lists_sorted() {
        let store = MemorySessionStore::new();
        let a = SessionAddress::new("laptop", "alice", "phone");
        let b = SessionAddress::new("laptop", "bob", "phone");

        store.store_session(&b, b"bob").unwrap();
        store.store_session(&a, b"alice").unwrap();
        assert_eq!(store.list_sessions().unwrap(), vec![a.clone(), b.clone()]);
        assert_eq!(store.load_session(&a).unwrap().as_deref(), Some(&b"alice"[..]));

        store.delete_session(&a).unwrap();
        assert!(!store.has_session(&a).unwrap());
        assert!(store.has_session(&b).unwrap());
    }
}
