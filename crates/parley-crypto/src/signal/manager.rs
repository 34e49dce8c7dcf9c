use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::safety_number;
use crate::signal::engine::SignalProtocolEngine;
use crate::signal::prekeys::{InitialMessage, OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::signal::state::{MessageHeader, SessionState};
use crate::signal::store::{IdentityKeyStore, PreKeyStore, SessionAddress, SessionStore};

/// The local side of every session a [`SessionManager`] handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDevice {
    pub user_id: String,
    pub device_id: String,
    /// Shown to contacts in the published bundle.
    pub device_name: String,
}

/// A ciphertext with the header the receiver needs to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: MessageHeader,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Manages Double Ratchet sessions between this device and remote devices.
///
/// Every operation is load → engine → store. Operations on the same
/// [`SessionAddress`] are serialized with a per-address lock; different
/// addresses proceed in parallel.
#[allow(clippy::struct_field_names)]
pub struct SessionManager {
    local: LocalDevice,
    engine: SignalProtocolEngine,
    identity_store: Box<dyn IdentityKeyStore>,
    prekey_store: Box<dyn PreKeyStore>,
    session_store: Box<dyn SessionStore>,
    locks: Mutex<HashMap<SessionAddress, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        local: LocalDevice,
        engine: SignalProtocolEngine,
        identity_store: Box<dyn IdentityKeyStore>,
        prekey_store: Box<dyn PreKeyStore>,
        session_store: Box<dyn SessionStore>,
    ) -> Self {
        Self {
            local,
            engine,
            identity_store,
            prekey_store,
            session_store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_device(&self) -> &LocalDevice {
        &self.local
    }

    pub fn engine(&self) -> &SignalProtocolEngine {
        &self.engine
    }

    pub fn address(&self, remote_user_id: &str, remote_device_id: &str) -> SessionAddress {
        SessionAddress::new(&self.local.device_id, remote_user_id, remote_device_id)
    }

    /// Generate and store a signed prekey plus `one_time_count` one-time
    /// prekeys, and return the bundle to publish.
    pub fn generate_pre_key_bundle(
        &self,
        signed_pre_key_id: u32,
        one_time_start_id: u32,
        one_time_count: u32,
    ) -> Result<PreKeyBundle, CryptoError> {
        let provider = self.engine.provider();
        let identity = self.identity_store.identity_key_pair()?;

        let signed_pre_key = SignedPreKey::generate(provider, &identity, signed_pre_key_id)?;
        let one_time_pre_keys =
            OneTimePreKey::generate_batch(provider, one_time_start_id, one_time_count)?;

        let bundle = PreKeyBundle::new(
            &self.local.user_id,
            &self.local.device_id,
            &self.local.device_name,
            &identity,
            &signed_pre_key,
            &one_time_pre_keys,
        );

        self.prekey_store.store_signed_pre_key(signed_pre_key)?;
        for pre_key in one_time_pre_keys {
            self.prekey_store.store_one_time_pre_key(pre_key)?;
        }

        tracing::info!(
            signed_pre_key_id,
            one_time_count,
            "generated prekey bundle"
        );
        Ok(bundle)
    }

    /// Start a session with the owner of `remote_bundle`.
    ///
    /// Replaces any existing session with that device. The returned
    /// [`InitialMessage`] must reach the remote device.
    pub fn establish_session(
        &self,
        remote_bundle: &PreKeyBundle,
    ) -> Result<InitialMessage, CryptoError> {
        self.ensure_trusted(
            &remote_bundle.user_id,
            &remote_bundle.device_id,
            &remote_bundle.identity_key,
        )?;
        let identity = self.identity_store.identity_key_pair()?;
        let address = self.address(&remote_bundle.user_id, &remote_bundle.device_id);

        let lock = self.session_lock(&address);
        let _guard = lock.lock();

        let initiation = self.engine.perform_x3dh_initiator(&identity, remote_bundle)?;
        self.persist(&address, &initiation.session)?;
        self.identity_store.save_identity(
            &remote_bundle.user_id,
            &remote_bundle.device_id,
            &remote_bundle.identity_key,
        )?;

        tracing::info!(%address, "session established");
        Ok(initiation.initial_message)
    }

    /// Complete a session started by a remote device.
    ///
    /// An initial message whose base key matches the stored session fails
    /// with [`CryptoError::DuplicateInitialMessage`]; accepting it again
    /// needs [`SessionManager::delete_session`] first. A new initial message
    /// from the same device replaces the stored session. The consumed
    /// one-time prekey is deleted.
    pub fn accept_session(
        &self,
        remote_user_id: &str,
        remote_device_id: &str,
        initial_message: &InitialMessage,
    ) -> Result<(), CryptoError> {
        self.ensure_trusted(remote_user_id, remote_device_id, &initial_message.identity_key)?;
        let identity = self.identity_store.identity_key_pair()?;
        let address = self.address(remote_user_id, remote_device_id);

        let lock = self.session_lock(&address);
        let _guard = lock.lock();

        if let Some(data) = self.session_store.load_session(&address)? {
            let existing = SessionState::deserialize(&data)?;
            if existing.base_key() == &initial_message.ephemeral_key {
                tracing::warn!(%address, "rejecting duplicate initial message");
                return Err(CryptoError::DuplicateInitialMessage(address.to_string()));
            }
        }

        let signed_pre_key_id = initial_message.signed_pre_key_id;
        let signed_pre_key = self
            .prekey_store
            .load_signed_pre_key(signed_pre_key_id)?
            .ok_or_else(|| {
                CryptoError::PreKeyError(format!("signed prekey {signed_pre_key_id} not found"))
            })?;
        let one_time_pre_key = match initial_message.one_time_pre_key_id {
            Some(key_id) => Some(self.prekey_store.load_one_time_pre_key(key_id)?.ok_or_else(
                || CryptoError::PreKeyError(format!("one-time prekey {key_id} not found")),
            )?),
            None => None,
        };

        let session = self.engine.perform_x3dh_responder(
            &identity,
            remote_user_id,
            remote_device_id,
            initial_message,
            &signed_pre_key,
            one_time_pre_key.as_ref(),
        )?;
        self.persist(&address, &session)?;
        if let Some(pre_key) = &one_time_pre_key {
            self.prekey_store.remove_one_time_pre_key(pre_key.key_id())?;
        }
        self.identity_store.save_identity(
            remote_user_id,
            remote_device_id,
            &initial_message.identity_key,
        )?;

        tracing::info!(
            %address,
            one_time_pre_key_id = ?initial_message.one_time_pre_key_id,
            "session accepted"
        );
        Ok(())
    }

    pub fn encrypt(
        &self,
        remote_user_id: &str,
        remote_device_id: &str,
        plaintext: &[u8],
    ) -> Result<Envelope, CryptoError> {
        let address = self.address(remote_user_id, remote_device_id);
        let lock = self.session_lock(&address);
        let _guard = lock.lock();

        let session = self.load(&address)?;
        let encrypted = self.engine.encrypt_message(&session, plaintext)?;
        self.persist(&address, &encrypted.session)?;

        Ok(Envelope {
            header: encrypted.header,
            ciphertext: encrypted.ciphertext,
        })
    }

    /// Decrypt an envelope. On failure the stored session is left as it was.
    pub fn decrypt(
        &self,
        remote_user_id: &str,
        remote_device_id: &str,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, CryptoError> {
        let address = self.address(remote_user_id, remote_device_id);
        let lock = self.session_lock(&address);
        let _guard = lock.lock();

        let session = self.load(&address)?;
        let decrypted = self
            .engine
            .decrypt_message(&session, &envelope.ciphertext, &envelope.header)
            .inspect_err(|e| {
                tracing::debug!(%address, error = %e, "decrypt failed");
            })?;
        self.persist(&address, &decrypted.session)?;

        Ok(decrypted.plaintext)
    }

    pub fn has_session(
        &self,
        remote_user_id: &str,
        remote_device_id: &str,
    ) -> Result<bool, CryptoError> {
        self.session_store
            .has_session(&self.address(remote_user_id, remote_device_id))
    }

    /// The stored session with a remote device.
    pub fn session(
        &self,
        remote_user_id: &str,
        remote_device_id: &str,
    ) -> Result<SessionState, CryptoError> {
        self.load(&self.address(remote_user_id, remote_device_id))
    }

    /// Forget a session (conversation reset, device unlink). The pinned
    /// identity key is kept.
    pub fn delete_session(
        &self,
        remote_user_id: &str,
        remote_device_id: &str,
    ) -> Result<(), CryptoError> {
        let address = self.address(remote_user_id, remote_device_id);
        {
            let lock = self.session_lock(&address);
            let _guard = lock.lock();
            self.session_store.delete_session(&address)?;
        }
        self.release_lock(&address);

        tracing::info!(%address, "session deleted");
        Ok(())
    }

    /// The safety number for this device and a remote identity.
    pub fn safety_number(
        &self,
        remote_user_id: &str,
        remote_identity_key: &[u8; 32],
    ) -> Result<String, CryptoError> {
        let identity = self.identity_store.identity_key_pair()?;
        Ok(safety_number::generate(
            &self.local.user_id,
            identity.identity_key(),
            remote_user_id,
            remote_identity_key,
        ))
    }

    fn ensure_trusted(
        &self,
        remote_user_id: &str,
        remote_device_id: &str,
        identity_key: &[u8; 32],
    ) -> Result<(), CryptoError> {
        if self
            .identity_store
            .is_trusted_identity(remote_user_id, remote_device_id, identity_key)?
        {
            return Ok(());
        }
        tracing::warn!(
            remote_user = remote_user_id,
            remote_device = remote_device_id,
            "remote identity key changed"
        );
        Err(CryptoError::UntrustedIdentity(format!(
            "{remote_user_id}.{remote_device_id}"
        )))
    }

    fn session_lock(&self, address: &SessionAddress) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().entry(address.clone()).or_default())
    }

    /// Drop the lock entry for `address` unless another caller holds it.
    fn release_lock(&self, address: &SessionAddress) {
        let mut locks = self.locks.lock();
        if locks
            .get(address)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(address);
        }
    }

    fn load(&self, address: &SessionAddress) -> Result<SessionState, CryptoError> {
        let data = self
            .session_store
            .load_session(address)?
            .ok_or_else(|| CryptoError::SessionNotFound(address.to_string()))?;
        SessionState::deserialize(&data)
    }

    fn persist(&self, address: &SessionAddress, session: &SessionState) -> Result<(), CryptoError> {
        self.session_store.store_session(address, &session.serialize()?)
    }
}
