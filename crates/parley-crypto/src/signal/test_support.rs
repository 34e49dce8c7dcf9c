//! Fixtures shared by the protocol tests.

use std::sync::Arc;

use crate::identity::IdentityKeyPair;
use crate::provider::{CryptoProvider, RustCryptoProvider};
use crate::signal::engine::{SignalProtocolEngine, X3dhInitiation};
use crate::signal::prekeys::{OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::signal::state::SessionState;

pub(crate) fn engine() -> SignalProtocolEngine {
    SignalProtocolEngine::new(Arc::new(RustCryptoProvider))
}

/// A device with an identity, a signed prekey (id 1) and one-time prekeys
/// numbered from 1.
pub(crate) struct Device {
    pub user_id: String,
    pub device_id: String,
    pub identity: IdentityKeyPair,
    pub signed_pre_key: SignedPreKey,
    pub one_time_pre_keys: Vec<OneTimePreKey>,
}

impl Device {
    pub fn new(
        provider: &dyn CryptoProvider,
        user_id: &str,
        device_id: &str,
        one_time_count: u32,
    ) -> Self {
        let identity = IdentityKeyPair::generate(provider).unwrap();
        let signed_pre_key = SignedPreKey::generate(provider, &identity, 1).unwrap();
        let one_time_pre_keys = OneTimePreKey::generate_batch(provider, 1, one_time_count).unwrap();
        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            identity,
            signed_pre_key,
            one_time_pre_keys,
        }
    }

    pub fn bundle(&self) -> PreKeyBundle {
        PreKeyBundle::new(
            &self.user_id,
            &self.device_id,
            "test device",
            &self.identity,
            &self.signed_pre_key,
            &self.one_time_pre_keys,
        )
    }

    pub fn one_time_pre_key(&self, key_id: u32) -> &OneTimePreKey {
        self.one_time_pre_keys
            .iter()
            .find(|k| k.key_id() == key_id)
            .unwrap()
    }
}

/// Alice's initiation towards Bob, and Bob's responder session.
pub(crate) fn session_pair() -> (X3dhInitiation, SessionState) {
    let engine = engine();
    let alice = Device::new(engine.provider(), "alice", "alice-laptop", 1);
    let bob = Device::new(engine.provider(), "bob", "bob-phone", 1);

    let initiation = engine
        .perform_x3dh_initiator(&alice.identity, &bob.bundle())
        .unwrap();
    let bob_session = engine
        .perform_x3dh_responder(
            &bob.identity,
            &alice.user_id,
            &alice.device_id,
            &initiation.initial_message,
            &bob.signed_pre_key,
            Some(bob.one_time_pre_key(1)),
        )
        .unwrap();
    (initiation, bob_session)
}
