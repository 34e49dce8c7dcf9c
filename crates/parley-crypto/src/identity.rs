use ed25519_dalek::SigningKey;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::provider::{random_array, CryptoProvider};

/// Upper bound for registration ids (14 bits, never zero).
const MAX_REGISTRATION_ID: u16 = 16380;

/// An X25519 key pair used for Diffie-Hellman (identity, prekeys, ratchet).
#[derive(Clone, ZeroizeOnDrop)]
pub struct X25519KeyPair {
    #[zeroize(skip)]
    public_key: [u8; 32],
    private_key: [u8; 32],
}

impl X25519KeyPair {
    /// Rebuild a key pair from its private half.
    pub fn from_private_bytes(private_key: [u8; 32]) -> Self {
        let public_key = X25519Public::from(&StaticSecret::from(private_key)).to_bytes();
        Self {
            public_key,
            private_key,
        }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// # Security
    /// Private key material.
    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }
}

impl PartialEq for X25519KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
            && bool::from(self.private_key.ct_eq(&other.private_key))
    }
}

impl Eq for X25519KeyPair {}

impl std::fmt::Debug for X25519KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X25519KeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// An Ed25519 signing key pair. The private half is the 32-byte seed.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Ed25519KeyPair {
    #[zeroize(skip)]
    public_key: [u8; 32],
    private_key: [u8; 32],
}

impl Ed25519KeyPair {
    pub fn from_private_bytes(private_key: [u8; 32]) -> Self {
        let public_key = SigningKey::from_bytes(&private_key)
            .verifying_key()
            .to_bytes();
        Self {
            public_key,
            private_key,
        }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// # Security
    /// Private key material.
    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }
}

impl std::fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519KeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// A device's long-term identity.
///
/// The X25519 half takes part in X3DH; the Ed25519 half signs prekeys so a
/// peer can tell the bundle it fetched was published by this device. One per
/// device, and the private halves never leave it.
#[derive(Clone)]
pub struct IdentityKeyPair {
    x25519: X25519KeyPair,
    signing: Ed25519KeyPair,
    registration_id: u32,
}

impl IdentityKeyPair {
    /// Generate a new random identity with a fresh registration id.
    pub fn generate(provider: &dyn CryptoProvider) -> Result<Self, CryptoError> {
        let x25519 = provider.generate_x25519_key_pair()?;
        let signing = provider.generate_ed25519_key_pair()?;
        let raw = u16::from_le_bytes(random_array::<2>(provider)?);
        let registration_id = u32::from(raw % MAX_REGISTRATION_ID) + 1;

        tracing::debug!(registration_id, "generated identity key pair");
        Ok(Self {
            x25519,
            signing,
            registration_id,
        })
    }

    /// Restore an identity from its stored private halves.
    pub fn from_private_bytes(
        x25519_private: [u8; 32],
        signing_private: [u8; 32],
        registration_id: u32,
    ) -> Self {
        Self {
            x25519: X25519KeyPair::from_private_bytes(x25519_private),
            signing: Ed25519KeyPair::from_private_bytes(signing_private),
            registration_id,
        }
    }

    /// The X25519 identity key published in bundles and initial messages.
    pub fn identity_key(&self) -> &[u8; 32] {
        self.x25519.public_key()
    }

    /// The Ed25519 key that verifies this device's prekey signatures.
    pub fn signing_key(&self) -> &[u8; 32] {
        self.signing.public_key()
    }

    pub fn x25519(&self) -> &X25519KeyPair {
        &self.x25519
    }

    pub fn signing(&self) -> &Ed25519KeyPair {
        &self.signing
    }

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    /// Sign a message with the identity signing key.
    pub fn sign(
        &self,
        provider: &dyn CryptoProvider,
        message: &[u8],
    ) -> Result<[u8; 64], CryptoError> {
        provider.ed25519_sign(self.signing.private_key(), message)
    }

    /// Hex rendering of the identity key (for display / logging).
    pub fn identity_key_hex(&self) -> String {
        hex::encode(self.identity_key())
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("identity_key", &self.identity_key_hex())
            .field("signing_key", &hex::encode(self.signing_key()))
            .field("registration_id", &self.registration_id)
            .finish()
    }
}
