use std::collections::VecDeque;
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::aead::AeadCipher;
use crate::config::RatchetConfig;
use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;
use crate::kdf::{concatenate, KeyDerivation};
use crate::provider::CryptoProvider;
use crate::signal::prekeys::{InitialMessage, OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::signal::state::{MessageHeader, SessionState, SkippedKeyId, SkippedMessageKeys};
use crate::signal::unix_millis;

/// Result of the initiator side of X3DH.
#[derive(Debug)]
pub struct X3dhInitiation {
    pub session: SessionState,
    /// Must reach the responder (usually alongside the first ciphertext).
    pub initial_message: InitialMessage,
}

#[derive(Debug)]
pub struct EncryptedMessage {
    pub ciphertext: Vec<u8>,
    pub header: MessageHeader,
    /// Replaces the session passed to `encrypt_message`.
    pub session: SessionState,
}

#[derive(Debug)]
pub struct DecryptedMessage {
    pub plaintext: Vec<u8>,
    /// Replaces the session passed to `decrypt_message`.
    pub session: SessionState,
}

/// X3DH handshake and Double Ratchet over [`SessionState`] values.
///
/// Stateless apart from the provider and limits: sessions go in by reference
/// and come back as new values. On any error no new session is returned, so
/// the caller's previous state stays usable.
pub struct SignalProtocolEngine {
    provider: Arc<dyn CryptoProvider>,
    config: RatchetConfig,
}

impl SignalProtocolEngine {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self::with_config(provider, RatchetConfig::default())
    }

    pub fn with_config(provider: Arc<dyn CryptoProvider>, config: RatchetConfig) -> Self {
        Self { provider, config }
    }

    pub fn provider(&self) -> &dyn CryptoProvider {
        self.provider.as_ref()
    }

    pub fn config(&self) -> &RatchetConfig {
        &self.config
    }

    fn kdf(&self) -> KeyDerivation<'_> {
        KeyDerivation::new(self.provider.as_ref())
    }

    fn aead(&self) -> AeadCipher<'_> {
        AeadCipher::new(self.provider.as_ref())
    }

    /// Start a session with the owner of `remote_bundle` (initiator side).
    ///
    /// Aborts with [`CryptoError::InvalidPreKeySignature`] before any key
    /// agreement if the signed prekey does not verify.
    pub fn perform_x3dh_initiator(
        &self,
        local_identity: &IdentityKeyPair,
        remote_bundle: &PreKeyBundle,
    ) -> Result<X3dhInitiation, CryptoError> {
        if let Err(e) = remote_bundle.verify_signed_pre_key(self.provider()) {
            tracing::warn!(
                remote_user = %remote_bundle.user_id,
                remote_device = %remote_bundle.device_id,
                "rejecting prekey bundle with invalid signature"
            );
            return Err(e);
        }

        let provider = self.provider();
        let ephemeral = provider.generate_x25519_key_pair()?;
        let signed_pre_key = &remote_bundle.signed_pre_key.public_key;
        let one_time_pre_key = remote_bundle.one_time_pre_key();

        // DH1 = DH(IKa, SPKb), DH2 = DH(EKa, IKb), DH3 = DH(EKa, SPKb), DH4 = DH(EKa, OPKb)
        let dh1 = provider.x25519_dh(local_identity.x25519().private_key(), signed_pre_key)?;
        let dh2 = provider.x25519_dh(ephemeral.private_key(), &remote_bundle.identity_key)?;
        let dh3 = provider.x25519_dh(ephemeral.private_key(), signed_pre_key)?;
        let dh4 = one_time_pre_key
            .map(|otpk| provider.x25519_dh(ephemeral.private_key(), &otpk.public_key))
            .transpose()?;

        let shared_secret = x3dh_secret(&dh1, &dh2, &dh3, dh4.as_deref());
        let (root_key, chain_key) = self.kdf().derive_x3dh_keys(&shared_secret)?;

        let initial_message = InitialMessage {
            identity_key: *local_identity.identity_key(),
            ephemeral_key: *ephemeral.public_key(),
            signed_pre_key_id: remote_bundle.signed_pre_key.key_id,
            one_time_pre_key_id: one_time_pre_key.map(|otpk| otpk.key_id),
        };

        let session = SessionState {
            remote_user_id: remote_bundle.user_id.clone(),
            remote_device_id: remote_bundle.device_id.clone(),
            remote_identity_key: remote_bundle.identity_key,
            base_key: *ephemeral.public_key(),
            dh_key_pair: ephemeral,
            remote_ratchet_key: Some(*signed_pre_key),
            root_key,
            sending_chain_key: Some(chain_key),
            receiving_chain_key: None,
            pending_chain_key: None,
            send_message_number: 0,
            receive_message_number: 0,
            previous_chain_length: 0,
            skipped_message_keys: SkippedMessageKeys::new(),
            previous_chains: VecDeque::new(),
            last_active: unix_millis(),
        };

        tracing::debug!(
            remote_user = %session.remote_user_id,
            remote_device = %session.remote_device_id,
            signed_pre_key_id = initial_message.signed_pre_key_id,
            one_time_pre_key_id = ?initial_message.one_time_pre_key_id,
            "X3DH initiated"
        );
        Ok(X3dhInitiation {
            session,
            initial_message,
        })
    }

    /// Complete X3DH from an [`InitialMessage`] (responder side).
    ///
    /// The returned session cannot encrypt until the initiator's first
    /// message has been decrypted. Deleting `consumed_one_time_pre_key` from
    /// storage is the caller's job.
    pub fn perform_x3dh_responder(
        &self,
        local_identity: &IdentityKeyPair,
        remote_user_id: &str,
        remote_device_id: &str,
        initial_message: &InitialMessage,
        local_signed_pre_key: &SignedPreKey,
        consumed_one_time_pre_key: Option<&OneTimePreKey>,
    ) -> Result<SessionState, CryptoError> {
        if initial_message.signed_pre_key_id != local_signed_pre_key.key_id() {
            return Err(CryptoError::PreKeyError(format!(
                "initial message uses signed prekey {}, got {}",
                initial_message.signed_pre_key_id,
                local_signed_pre_key.key_id()
            )));
        }
        match (initial_message.one_time_pre_key_id, consumed_one_time_pre_key) {
            (None, None) => {}
            (Some(expected), Some(otpk)) if otpk.key_id() == expected => {}
            (Some(expected), Some(otpk)) => {
                return Err(CryptoError::PreKeyError(format!(
                    "initial message uses one-time prekey {expected}, got {}",
                    otpk.key_id()
                )));
            }
            (Some(expected), None) => {
                return Err(CryptoError::PreKeyError(format!(
                    "one-time prekey {expected} was not supplied"
                )));
            }
            (None, Some(otpk)) => {
                return Err(CryptoError::PreKeyError(format!(
                    "initial message names no one-time prekey, got {}",
                    otpk.key_id()
                )));
            }
        }

        let provider = self.provider();
        let signed_pre_key = local_signed_pre_key.key_pair().private_key();
        let their_identity = &initial_message.identity_key;
        let their_ephemeral = &initial_message.ephemeral_key;

        let dh1 = provider.x25519_dh(signed_pre_key, their_identity)?;
        let dh2 = provider.x25519_dh(local_identity.x25519().private_key(), their_ephemeral)?;
        let dh3 = provider.x25519_dh(signed_pre_key, their_ephemeral)?;
        let dh4 = consumed_one_time_pre_key
            .map(|otpk| provider.x25519_dh(otpk.key_pair().private_key(), their_ephemeral))
            .transpose()?;

        let shared_secret = x3dh_secret(&dh1, &dh2, &dh3, dh4.as_deref());
        let (root_key, chain_key) = self.kdf().derive_x3dh_keys(&shared_secret)?;

        let session = SessionState {
            remote_user_id: remote_user_id.to_owned(),
            remote_device_id: remote_device_id.to_owned(),
            remote_identity_key: *their_identity,
            base_key: *their_ephemeral,
            dh_key_pair: local_signed_pre_key.key_pair().clone(),
            remote_ratchet_key: None,
            root_key,
            sending_chain_key: None,
            receiving_chain_key: None,
            pending_chain_key: Some(chain_key),
            send_message_number: 0,
            receive_message_number: 0,
            previous_chain_length: 0,
            skipped_message_keys: SkippedMessageKeys::new(),
            previous_chains: VecDeque::new(),
            last_active: unix_millis(),
        };

        tracing::debug!(
            remote_user = %session.remote_user_id,
            remote_device = %session.remote_device_id,
            signed_pre_key_id = initial_message.signed_pre_key_id,
            one_time_pre_key_id = ?initial_message.one_time_pre_key_id,
            "X3DH accepted"
        );
        Ok(session)
    }

    /// Encrypt one message and advance the sending chain.
    pub fn encrypt_message(
        &self,
        session: &SessionState,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage, CryptoError> {
        let chain_key = session
            .sending_chain_key
            .as_ref()
            .ok_or(CryptoError::NoSendingChain)?;
        let next_message_number = session
            .send_message_number
            .checked_add(1)
            .ok_or_else(|| CryptoError::EncryptionError("sending chain exhausted".into()))?;

        let kdf = self.kdf();
        let (message_key, next_chain_key) = kdf.advance_chain_key(chain_key)?;
        let keys = kdf.derive_message_encryption_keys(&message_key)?;

        let header = MessageHeader {
            ratchet_key: *session.dh_key_pair.public_key(),
            previous_chain_length: session.previous_chain_length,
            message_number: session.send_message_number,
        };
        let ciphertext =
            self.aead()
                .encrypt(keys.aes_key(), keys.iv(), plaintext, Some(&header.to_bytes()))?;

        let mut next = session.clone();
        next.sending_chain_key = Some(next_chain_key);
        next.send_message_number = next_message_number;
        next.last_active = unix_millis();

        tracing::trace!(
            remote_user = %next.remote_user_id,
            remote_device = %next.remote_device_id,
            message_number = header.message_number,
            "encrypted message"
        );
        Ok(EncryptedMessage {
            ciphertext,
            header,
            session: next,
        })
    }

    /// Decrypt one message, ratcheting and caching skipped keys as needed.
    pub fn decrypt_message(
        &self,
        session: &SessionState,
        ciphertext: &[u8],
        header: &MessageHeader,
    ) -> Result<DecryptedMessage, CryptoError> {
        let mut next = session.clone();
        let skipped_id = SkippedKeyId {
            ratchet_key: header.ratchet_key,
            message_number: header.message_number,
        };

        let message_key = if let Some(key) = next.skipped_message_keys.take(&skipped_id) {
            tracing::trace!(
                message_number = header.message_number,
                "using skipped message key"
            );
            key
        } else if let Some(closed) = next.previous_chain(&header.ratchet_key) {
            // Keys of a closed chain exist only in the skipped cache.
            if header.message_number < closed.final_counter {
                tracing::warn!(
                    remote_user = %next.remote_user_id,
                    remote_device = %next.remote_device_id,
                    message_number = header.message_number,
                    "rejecting replayed message from a closed chain"
                );
                return Err(CryptoError::ReplayedMessage {
                    message_number: header.message_number,
                });
            }
            return Err(CryptoError::MissingMessageKey {
                ratchet_key: hex::encode(header.ratchet_key),
                message_number: header.message_number,
            });
        } else {
            if next.remote_ratchet_key.as_ref() != Some(&header.ratchet_key) {
                self.skip_message_keys(&mut next, header.previous_chain_length)?;
                self.dh_ratchet(&mut next, &header.ratchet_key)?;
            }
            if header.message_number < next.receive_message_number {
                tracing::warn!(
                    remote_user = %next.remote_user_id,
                    remote_device = %next.remote_device_id,
                    message_number = header.message_number,
                    "rejecting replayed message"
                );
                return Err(CryptoError::ReplayedMessage {
                    message_number: header.message_number,
                });
            }
            self.skip_message_keys(&mut next, header.message_number)?;

            let chain_key = next.receiving_chain_key.as_ref().ok_or_else(|| {
                CryptoError::MissingMessageKey {
                    ratchet_key: hex::encode(header.ratchet_key),
                    message_number: header.message_number,
                }
            })?;
            let (message_key, next_chain_key) = self.kdf().advance_chain_key(chain_key)?;
            next.receiving_chain_key = Some(next_chain_key);
            next.receive_message_number = header.message_number.checked_add(1).ok_or_else(|| {
                CryptoError::InvalidInput("message number out of range".into())
            })?;
            message_key
        };

        let keys = self.kdf().derive_message_encryption_keys(&message_key)?;
        let plaintext =
            self.aead()
                .decrypt(keys.aes_key(), keys.iv(), ciphertext, Some(&header.to_bytes()))?;
        next.last_active = unix_millis();

        tracing::trace!(
            remote_user = %next.remote_user_id,
            remote_device = %next.remote_device_id,
            message_number = header.message_number,
            "decrypted message"
        );
        Ok(DecryptedMessage {
            plaintext,
            session: next,
        })
    }

    /// Advance the receiving chain to `until`, caching the keys passed over.
    fn skip_message_keys(&self, state: &mut SessionState, until: u32) -> Result<(), CryptoError> {
        let (Some(ratchet_key), Some(mut chain_key)) =
            (state.remote_ratchet_key, state.receiving_chain_key.clone())
        else {
            return Ok(());
        };
        if until <= state.receive_message_number {
            return Ok(());
        }

        let gap = until - state.receive_message_number;
        if gap > self.config.max_skip {
            tracing::warn!(
                remote_user = %state.remote_user_id,
                remote_device = %state.remote_device_id,
                gap,
                limit = self.config.max_skip,
                "rejecting message beyond skip window"
            );
            return Err(CryptoError::TooManySkippedMessages {
                requested: gap,
                limit: self.config.max_skip,
            });
        }

        let kdf = self.kdf();
        let mut evicted = 0;
        for message_number in state.receive_message_number..until {
            let (message_key, next_chain_key) = kdf.advance_chain_key(&chain_key)?;
            evicted += state.skipped_message_keys.insert(
                SkippedKeyId {
                    ratchet_key,
                    message_number,
                },
                message_key,
                self.config.max_skipped_keys,
            );
            chain_key = next_chain_key;
        }
        state.receiving_chain_key = Some(chain_key);
        state.receive_message_number = until;

        if evicted > 0 {
            tracing::warn!(
                remote_user = %state.remote_user_id,
                evicted,
                "evicted oldest skipped message keys"
            );
        }
        tracing::debug!(gap, cached = state.skipped_message_keys.len(), "skipped message keys");
        Ok(())
    }

    /// DH-ratchet step on receipt of a new remote ratchet key: new receiving
    /// chain, new local ratchet key pair, new sending chain.
    fn dh_ratchet(
        &self,
        state: &mut SessionState,
        remote_key: &[u8; 32],
    ) -> Result<(), CryptoError> {
        let provider = self.provider();
        let kdf = self.kdf();

        let receiving_chain_key = if let Some(pending) = state.pending_chain_key.take() {
            pending
        } else {
            let dh = provider.x25519_dh(state.dh_key_pair.private_key(), remote_key)?;
            let (root_key, chain_key) = kdf.derive_ratchet_keys(&state.root_key, &dh[..])?;
            state.root_key = root_key;
            chain_key
        };

        let key_pair = provider.generate_x25519_key_pair()?;
        let dh = provider.x25519_dh(key_pair.private_key(), remote_key)?;
        let (root_key, sending_chain_key) = kdf.derive_ratchet_keys(&state.root_key, &dh[..])?;

        let closed = state
            .remote_ratchet_key
            .filter(|_| state.receiving_chain_key.is_some());
        if let Some(closed) = closed {
            state.close_receiving_chain(closed, state.receive_message_number);
        }
        state.previous_chain_length = state.send_message_number;
        state.send_message_number = 0;
        state.receive_message_number = 0;
        state.remote_ratchet_key = Some(*remote_key);
        state.receiving_chain_key = Some(receiving_chain_key);
        state.root_key = root_key;
        state.sending_chain_key = Some(sending_chain_key);
        state.dh_key_pair = key_pair;

        tracing::debug!(
            remote_user = %state.remote_user_id,
            remote_device = %state.remote_device_id,
            previous_chain_length = state.previous_chain_length,
            "DH ratchet step"
        );
        Ok(())
    }
}

/// `DH1 || DH2 || DH3 [|| DH4]`, in that order.
fn x3dh_secret(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    dh4: Option<&[u8; 32]>,
) -> Zeroizing<Vec<u8>> {
    let mut parts = vec![dh1.as_slice(), dh2.as_slice(), dh3.as_slice()];
    if let Some(dh4) = dh4 {
        parts.push(dh4.as_slice());
    }
    Zeroizing::new(concatenate(&parts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::provider::RustCryptoProvider;
    use crate::signal::test_support::{engine, session_pair, Device};

    /// Deliver `message` to `session`, returning the plaintext and new state.
    fn deliver(
        engine: &SignalProtocolEngine,
        session: &SessionState,
        message: &EncryptedMessage,
    ) -> Result<(Vec<u8>, SessionState), CryptoError> {
        let decrypted = engine.decrypt_message(session, &message.ciphertext, &message.header)?;
        Ok((decrypted.plaintext, decrypted.session))
    }

    #[test]
    fn alice_and_bob_agree_on_root_key() {
        let engine = engine();
        let alice = Device::new(engine.provider(), "alice", "alice-phone", 5);
        let bob = Device::new(engine.provider(), "bob", "bob-phone", 5);

        let bob_bundle = bob.bundle();
        assert_eq!(bob_bundle.one_time_pre_keys.first().map(|k| k.key_id), Some(1));

        let initiation = engine
            .perform_x3dh_initiator(&alice.identity, &bob_bundle)
            .unwrap();
        assert_eq!(initiation.initial_message.one_time_pre_key_id, Some(1));
        assert_eq!(initiation.initial_message.ephemeral_key, *initiation.session.dh_public_key());

        let consumed = bob.one_time_pre_key(1);
        let bob_session = engine
            .perform_x3dh_responder(
                &bob.identity,
                "alice",
                "alice-phone",
                &initiation.initial_message,
                &bob.signed_pre_key,
                Some(consumed),
            )
            .unwrap();

        assert_eq!(bob_session.root_key(), initiation.session.root_key());
        assert!(bob_session.receiving_chain_key().is_none());
        assert!(bob_session.sending_chain_key().is_none());
        assert!(initiation.session.sending_chain_key().is_some());
        assert!(initiation.session.receiving_chain_key().is_none());
        assert_eq!(bob_session.remote_identity_key(), alice.identity.identity_key());
    }

    #[test]
    fn bundle_without_one_time_prekeys() {
        let engine = engine();
        let alice = Device::new(engine.provider(), "alice", "a1", 0);
        let bob = Device::new(engine.provider(), "bob", "b1", 0);

        let initiation = engine
            .perform_x3dh_initiator(&alice.identity, &bob.bundle())
            .unwrap();
        assert_eq!(initiation.initial_message.one_time_pre_key_id, None);

        let bob_session = engine
            .perform_x3dh_responder(
                &bob.identity,
                "alice",
                "a1",
                &initiation.initial_message,
                &bob.signed_pre_key,
                None,
            )
            .unwrap();
        assert_eq!(bob_session.root_key(), initiation.session.root_key());

        let sent = engine.encrypt_message(&initiation.session, b"no opk").unwrap();
        let (plaintext, _) = deliver(&engine, &bob_session, &sent).unwrap();
        assert_eq!(plaintext, b"no opk");
    }

    #[test]
    fn tampered_signed_prekey_aborts_initiator() {
        let engine = engine();
        let alice = Device::new(engine.provider(), "alice", "a1", 1);
        let bob = Device::new(engine.provider(), "bob", "b1", 1);

        let mut bundle = bob.bundle();
        bundle.signed_pre_key.signature[0] ^= 0x01;
        let err = engine
            .perform_x3dh_initiator(&alice.identity, &bundle)
            .unwrap_err();
        assert!(matches!(err, CryptoError::InvalidPreKeySignature));
        assert_eq!(err.to_string(), "invalid prekey signature");

        let mut bundle = bob.bundle();
        bundle.signing_key = *alice.identity.signing_key();
        assert!(engine.perform_x3dh_initiator(&alice.identity, &bundle).is_err());
    }

    #[test]
    fn responder_rejects_mismatched_prekeys() {
        let engine = engine();
        let alice = Device::new(engine.provider(), "alice", "a1", 2);
        let bob = Device::new(engine.provider(), "bob", "b1", 2);
        let initiation = engine
            .perform_x3dh_initiator(&alice.identity, &bob.bundle())
            .unwrap();
        let message = &initiation.initial_message;

        let wrong_opk = bob.one_time_pre_key(2);
        let err = engine
            .perform_x3dh_responder(
                &bob.identity,
                "alice",
                "a1",
                message,
                &bob.signed_pre_key,
                Some(wrong_opk),
            )
            .unwrap_err();
        assert!(matches!(err, CryptoError::PreKeyError(_)));

        let err = engine
            .perform_x3dh_responder(
                &bob.identity,
                "alice",
                "a1",
                message,
                &bob.signed_pre_key,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, CryptoError::PreKeyError(_)));

        let other_spk = SignedPreKey::generate(engine.provider(), &bob.identity, 99).unwrap();
        let err = engine
            .perform_x3dh_responder(
                &bob.identity,
                "alice",
                "a1",
                message,
                &other_spk,
                Some(bob.one_time_pre_key(1)),
            )
            .unwrap_err();
        assert!(matches!(err, CryptoError::PreKeyError(_)));
    }

    #[test]
    fn ten_sequential_messages_in_order() {
        let engine = engine();
        let (alice, mut bob) = session_pair();
        let mut alice_session = alice.session;

        for expected in 0..10u32 {
            let text = format!("message {expected}");
            let sent = engine.encrypt_message(&alice_session, text.as_bytes()).unwrap();
            assert_eq!(sent.header.message_number, expected);
            alice_session = sent.session.clone();

            let (plaintext, next) = deliver(&engine, &bob, &sent).unwrap();
            assert_eq!(plaintext, text.as_bytes());
            assert_eq!(next.receive_message_number(), expected + 1);
            bob = next;
        }
        assert!(bob.skipped_message_keys().is_empty());
    }

    #[test]
    fn same_plaintext_encrypts_differently() {
        let engine = engine();
        let (alice, _) = session_pair();

        let first = engine.encrypt_message(&alice.session, b"hello").unwrap();
        let second = engine.encrypt_message(&first.session, b"hello").unwrap();
        assert_ne!(first.ciphertext, second.ciphertext);
        assert_eq!(first.ciphertext.len(), 5 + 16);
    }

    #[test]
    fn encrypt_does_not_touch_input_session() {
        let engine = engine();
        let (alice, _) = session_pair();
        let before = alice.session.clone();

        let sent = engine.encrypt_message(&alice.session, b"value semantics").unwrap();
        assert_eq!(alice.session, before);
        assert_eq!(sent.session.send_message_number(), 1);
        assert_ne!(sent.session.sending_chain_key(), before.sending_chain_key());
        assert_eq!(sent.session.root_key(), before.root_key());
    }

    #[test]
    fn responder_cannot_send_first() {
        let engine = engine();
        let (alice, bob) = session_pair();

        let err = engine.encrypt_message(&bob, b"too early").unwrap_err();
        assert!(matches!(err, CryptoError::NoSendingChain));
        assert_eq!(err.kind(), ErrorKind::ProtocolState);
        assert!(!bob.can_send());

        let sent = engine.encrypt_message(&alice.session, b"hi bob").unwrap();
        let (_, bob) = deliver(&engine, &bob, &sent).unwrap();
        assert!(bob.can_send());
        assert!(bob.receiving_chain_key().is_some());
        assert!(engine.encrypt_message(&bob, b"hi alice").is_ok());
    }

    #[test]
    fn conversation_with_several_turns() {
        let engine = engine();
        let (alice, bob) = session_pair();
        let mut alice = alice.session;
        let mut bob = bob;

        for round in 0..4 {
            for i in 0..3 {
                let text = format!("alice {round}.{i}");
                let sent = engine.encrypt_message(&alice, text.as_bytes()).unwrap();
                alice = sent.session.clone();
                let (plaintext, next) = deliver(&engine, &bob, &sent).unwrap();
                assert_eq!(plaintext, text.as_bytes());
                bob = next;
            }
            let bob_key_before = *bob.dh_public_key();
            for i in 0..2 {
                let text = format!("bob {round}.{i}");
                let sent = engine.encrypt_message(&bob, text.as_bytes()).unwrap();
                bob = sent.session.clone();
                let (plaintext, next) = deliver(&engine, &alice, &sent).unwrap();
                assert_eq!(plaintext, text.as_bytes());
                alice = next;
            }
            assert_eq!(*bob.dh_public_key(), bob_key_before);
        }
        assert_eq!(alice.remote_ratchet_key(), Some(bob.dh_public_key()));
    }

    #[test]
    fn out_of_order_within_chain() {
        let engine = engine();
        let (alice, mut bob) = session_pair();
        let mut alice_session = alice.session;

        let mut sent = Vec::new();
        for i in 0..5 {
            let message = engine
                .encrypt_message(&alice_session, format!("m{i}").as_bytes())
                .unwrap();
            alice_session = message.session.clone();
            sent.push(message);
        }

        for index in [4usize, 2, 0, 1, 3] {
            let (plaintext, next) = deliver(&engine, &bob, &sent[index]).unwrap();
            assert_eq!(plaintext, format!("m{index}").as_bytes());
            bob = next;
        }
        assert!(bob.skipped_message_keys().is_empty());
        assert_eq!(bob.receive_message_number(), 5);
    }

    #[test]
    fn out_of_order_across_ratchet_turn() {
        let engine = engine();
        let (alice, bob) = session_pair();

        let a0 = engine.encrypt_message(&alice.session, b"a0").unwrap();
        let a1 = engine.encrypt_message(&a0.session, b"a1").unwrap();
        let (_, bob) = deliver(&engine, &bob, &a0).unwrap();

        let b0 = engine.encrypt_message(&bob, b"b0").unwrap();
        let (plaintext, alice) = deliver(&engine, &a1.session, &b0).unwrap();
        assert_eq!(plaintext, b"b0");

        let a2 = engine.encrypt_message(&alice, b"a2").unwrap();
        assert_eq!(a2.header.previous_chain_length, 2);
        assert_eq!(a2.header.message_number, 0);

        let (plaintext, bob) = deliver(&engine, &b0.session, &a2).unwrap();
        assert_eq!(plaintext, b"a2");
        assert_eq!(bob.skipped_message_keys().len(), 1);

        let (plaintext, bob) = deliver(&engine, &bob, &a1).unwrap();
        assert_eq!(plaintext, b"a1");
        assert!(bob.skipped_message_keys().is_empty());
    }

    #[test]
    fn replayed_message_rejected() {
        let engine = engine();
        let (alice, bob) = session_pair();

        let m0 = engine.encrypt_message(&alice.session, b"once").unwrap();
        let m1 = engine.encrypt_message(&m0.session, b"twice").unwrap();

        let (_, bob) = deliver(&engine, &bob, &m0).unwrap();
        let err = deliver(&engine, &bob, &m0).unwrap_err();
        assert!(matches!(err, CryptoError::ReplayedMessage { message_number: 0 }));
        assert_eq!(err.kind(), ErrorKind::Replay);

        // A skipped key is consumed on first use as well.
        let (_, bob) = deliver(&engine, &bob, &m1).unwrap();
        let err = deliver(&engine, &bob, &m1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Replay);
    }

    #[test]
    fn replay_from_closed_chain_rejected() {
        let engine = engine();
        let (alice, bob) = session_pair();

        let a0 = engine.encrypt_message(&alice.session, b"a0").unwrap();
        let (_, bob) = deliver(&engine, &bob, &a0).unwrap();
        let b0 = engine.encrypt_message(&bob, b"b0").unwrap();
        let (_, alice) = deliver(&engine, &a0.session, &b0).unwrap();
        let a1 = engine.encrypt_message(&alice, b"a1").unwrap();
        assert_ne!(a1.header.ratchet_key, a0.header.ratchet_key);
        let (plaintext, bob) = deliver(&engine, &b0.session, &a1).unwrap();
        assert_eq!(plaintext, b"a1");

        let err = deliver(&engine, &bob, &a0).unwrap_err();
        assert!(matches!(err, CryptoError::ReplayedMessage { message_number: 0 }));
        assert_eq!(err.kind(), ErrorKind::Replay);

        // Nothing ratcheted: the live chain still decrypts.
        let a2 = engine.encrypt_message(&a1.session, b"a2").unwrap();
        let (plaintext, _) = deliver(&engine, &bob, &a2).unwrap();
        assert_eq!(plaintext, b"a2");
    }

    #[test]
    fn skipped_key_replay_rejected() {
        let engine = engine();
        let (alice, bob) = session_pair();

        let m0 = engine.encrypt_message(&alice.session, b"zero").unwrap();
        let m1 = engine.encrypt_message(&m0.session, b"one").unwrap();

        let (_, bob) = deliver(&engine, &bob, &m1).unwrap();
        let (plaintext, bob) = deliver(&engine, &bob, &m0).unwrap();
        assert_eq!(plaintext, b"zero");
        assert!(matches!(
            deliver(&engine, &bob, &m0),
            Err(CryptoError::ReplayedMessage { message_number: 0 })
        ));
    }

    #[test]
    fn gap_beyond_window_is_recoverable() {
        let strict = SignalProtocolEngine::with_config(
            Arc::new(RustCryptoProvider),
            RatchetConfig {
                max_skip: 5,
                max_skipped_keys: 100,
            },
        );
        let (alice, bob) = session_pair();

        let mut session = alice.session;
        let mut sent = Vec::new();
        for i in 0..8 {
            let message = strict.encrypt_message(&session, &[i]).unwrap();
            session = message.session.clone();
            sent.push(message);
        }

        let err = deliver(&strict, &bob, &sent[7]).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::TooManySkippedMessages {
                requested: 7,
                limit: 5
            }
        ));

        let (plaintext, bob) = deliver(&strict, &bob, &sent[0]).unwrap();
        assert_eq!(plaintext, vec![0]);
        let (plaintext, _) = deliver(&strict, &bob, &sent[5]).unwrap();
        assert_eq!(plaintext, vec![5]);
    }

    #[test]
    fn skipped_keys_capped() {
        let capped = SignalProtocolEngine::with_config(
            Arc::new(RustCryptoProvider),
            RatchetConfig {
                max_skip: 50,
                max_skipped_keys: 3,
            },
        );
        let (alice, bob) = session_pair();

        let mut session = alice.session;
        let mut last = None;
        for i in 0..9 {
            let message = capped.encrypt_message(&session, &[i]).unwrap();
            session = message.session.clone();
            last = Some(message);
        }
        let last = last.unwrap();

        let (_, bob) = deliver(&capped, &bob, &last).unwrap();
        assert_eq!(bob.skipped_message_keys().len(), 3);
        let kept: Vec<u32> = bob
            .skipped_message_keys()
            .iter()
            .map(|(id, _)| id.message_number)
            .collect();
        assert_eq!(kept, vec![5, 6, 7]);
    }

    #[test]
    fn tampering_fails_without_corrupting_session() {
        let engine = engine();
        let (alice, bob) = session_pair();
        let sent = engine.encrypt_message(&alice.session, b"integrity").unwrap();

        let mut ciphertext = sent.ciphertext.clone();
        ciphertext[0] ^= 0x01;
        let err = engine
            .decrypt_message(&bob, &ciphertext, &sent.header)
            .unwrap_err();
        assert!(matches!(err, CryptoError::AuthenticationFailed));

        let mut header = sent.header;
        header.previous_chain_length += 1;
        let err = engine
            .decrypt_message(&bob, &sent.ciphertext, &header)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let (plaintext, _) = deliver(&engine, &bob, &sent).unwrap();
        assert_eq!(plaintext, b"integrity");
    }

    #[test]
    fn session_survives_serialization_mid_conversation() {
        let engine = engine();
        let (alice, bob) = session_pair();

        let m0 = engine.encrypt_message(&alice.session, b"before").unwrap();
        let m1 = engine.encrypt_message(&m0.session, b"skipped").unwrap();
        let m2 = engine.encrypt_message(&m1.session, b"after").unwrap();

        let (_, bob) = deliver(&engine, &bob, &m0).unwrap();
        let (_, bob) = deliver(&engine, &bob, &m2).unwrap();

        let restored = SessionState::deserialize(&bob.serialize().unwrap()).unwrap();
        assert_eq!(restored, bob);
        let (plaintext, restored) = deliver(&engine, &restored, &m1).unwrap();
        assert_eq!(plaintext, b"skipped");

        let reply = engine.encrypt_message(&restored, b"reply").unwrap();
        let (plaintext, _) = deliver(&engine, &m2.session, &reply).unwrap();
        assert_eq!(plaintext, b"reply");
    }

    #[test]
    fn empty_message_roundtrip() {
        let engine = engine();
        let (alice, bob) = session_pair();
        let sent = engine.encrypt_message(&alice.session, b"").unwrap();
        assert_eq!(sent.ciphertext.len(), 16);
        let (plaintext, _) = deliver(&engine, &bob, &sent).unwrap();
        assert!(plaintext.is_empty());
    }
}
