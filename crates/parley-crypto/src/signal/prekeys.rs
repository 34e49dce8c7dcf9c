//! Prekeys, prekey bundles, and the X3DH initial message.
//!
//! A device publishes a [`PreKeyBundle`] so a contact can start a session
//! while it is offline. The initiator answers with an [`InitialMessage`]
//! that tells the responder which prekeys were used.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, X25519KeyPair};
use crate::provider::CryptoProvider;
use crate::signal::unix_millis;

/// Medium-term X25519 prekey signed by the identity key. Rotated periodically.
#[derive(Clone)]
pub struct SignedPreKey {
    key_id: u32,
    key_pair: X25519KeyPair,
    signature: [u8; 64],
    created_at: u64,
}

impl SignedPreKey {
    /// Generate a prekey and sign its public key with `identity`.
    pub fn generate(
        provider: &dyn CryptoProvider,
        identity: &IdentityKeyPair,
        key_id: u32,
    ) -> Result<Self, CryptoError> {
        let key_pair = provider.generate_x25519_key_pair()?;
        let signature = identity.sign(provider, key_pair.public_key())?;

        tracing::debug!(key_id, "generated signed prekey");
        Ok(Self {
            key_id,
            key_pair,
            signature,
            created_at: unix_millis(),
        })
    }

    /// Restore a stored signed prekey.
    pub fn from_parts(
        key_id: u32,
        key_pair: X25519KeyPair,
        signature: [u8; 64],
        created_at: u64,
    ) -> Self {
        Self {
            key_id,
            key_pair,
            signature,
            created_at,
        }
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn key_pair(&self) -> &X25519KeyPair {
        &self.key_pair
    }

    pub fn signature(&self) -> &[u8; 64] {
        &self.signature
    }

    /// Creation time in unix milliseconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Whether this prekey is older than `max_age` at `now` (unix ms).
    pub fn needs_rotation(&self, now: u64, max_age: Duration) -> bool {
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        now.saturating_sub(self.created_at) >= max_age_ms
    }

    /// The publishable half.
    pub fn public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            key_id: self.key_id,
            public_key: *self.key_pair.public_key(),
            signature: self.signature.to_vec(),
        }
    }
}

impl std::fmt::Debug for SignedPreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedPreKey")
            .field("key_id", &self.key_id)
            .field("key_pair", &self.key_pair)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Single-use X25519 prekey. The caller deletes it once consumed.
#[derive(Debug, Clone)]
pub struct OneTimePreKey {
    key_id: u32,
    key_pair: X25519KeyPair,
}

impl OneTimePreKey {
    pub fn generate(provider: &dyn CryptoProvider, key_id: u32) -> Result<Self, CryptoError> {
        Ok(Self {
            key_id,
            key_pair: provider.generate_x25519_key_pair()?,
        })
    }

    /// Generate `count` prekeys with consecutive ids starting at `start_id`.
    pub fn generate_batch(
        provider: &dyn CryptoProvider,
        start_id: u32,
        count: u32,
    ) -> Result<Vec<Self>, CryptoError> {
        let end_id = start_id
            .checked_add(count)
            .ok_or_else(|| CryptoError::PreKeyError("prekey id range overflows u32".into()))?;
        let batch = (start_id..end_id)
            .map(|key_id| Self::generate(provider, key_id))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(start_id, count, "generated one-time prekeys");
        Ok(batch)
    }

    pub fn from_parts(key_id: u32, key_pair: X25519KeyPair) -> Self {
        Self { key_id, key_pair }
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn key_pair(&self) -> &X25519KeyPair {
        &self.key_pair
    }

    pub fn public(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            key_id: self.key_id,
            public_key: *self.key_pair.public_key(),
        }
    }
}

/// Published form of a [`SignedPreKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub key_id: u32,
    /// X25519 public key.
    pub public_key: [u8; 32],
    /// Ed25519 signature over `public_key` by the identity signing key.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Published form of a [`OneTimePreKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub key_id: u32,
    pub public_key: [u8; 32],
}

/// A snapshot of public keys published for session establishment.
///
/// Read-only input to the initiator; the wire format is owned by the
/// transport, so this only derives serde.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub user_id: String,
    pub device_id: String,
    /// X25519 identity public key.
    pub identity_key: [u8; 32],
    /// Ed25519 key that signed `signed_pre_key`.
    pub signing_key: [u8; 32],
    pub signed_pre_key: SignedPreKeyPublic,
    /// May be empty once the responder has run out of one-time prekeys.
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
    pub registration_id: u32,
    pub device_name: String,
}

impl PreKeyBundle {
    /// Build a bundle from local key material.
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        identity: &IdentityKeyPair,
        signed_pre_key: &SignedPreKey,
        one_time_pre_keys: &[OneTimePreKey],
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            identity_key: *identity.identity_key(),
            signing_key: *identity.signing_key(),
            signed_pre_key: signed_pre_key.public(),
            one_time_pre_keys: one_time_pre_keys.iter().map(OneTimePreKey::public).collect(),
            registration_id: identity.registration_id(),
            device_name: device_name.into(),
        }
    }

    /// Check the signed prekey's signature against the bundle's signing key.
    pub fn verify_signed_pre_key(&self, provider: &dyn CryptoProvider) -> Result<(), CryptoError> {
        let signature = <[u8; 64]>::try_from(self.signed_pre_key.signature.as_slice())
            .map_err(|_| CryptoError::InvalidPreKeySignature)?;
        if provider.ed25519_verify(&self.signing_key, &self.signed_pre_key.public_key, &signature) {
            Ok(())
        } else {
            Err(CryptoError::InvalidPreKeySignature)
        }
    }

    /// The one-time prekey an initiator should consume, if any is left.
    pub fn one_time_pre_key(&self) -> Option<&OneTimePreKeyPublic> {
        self.one_time_pre_keys.first()
    }
}

/// Sent once by the initiator so the responder can complete X3DH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialMessage {
    /// Initiator's X25519 identity public key.
    pub identity_key: [u8; 32],
    /// Initiator's ephemeral X25519 public key (also its first ratchet key).
    pub ephemeral_key: [u8; 32],
    pub signed_pre_key_id: u32,
    /// The one-time prekey consumed by the initiator, if the bundle had one.
    pub one_time_pre_key_id: Option<u32>,
}
