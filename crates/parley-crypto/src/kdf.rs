//! Key schedule for X3DH and the Double Ratchet.
//!
//! ```text
//! DH1 || DH2 || DH3 [|| DH4] ──HKDF──▶ (root key, chain key)
//! (root key, DH output)      ──HKDF──▶ (root key', chain key)
//! chain key ──HMAC(0x01)──▶ message key
//! chain key ──HMAC(0x02)──▶ next chain key
//! message key ──HKDF──▶ AES-256 key (32) || IV (12)
//! ```

use subtle::ConstantTimeEq;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::provider::CryptoProvider;

/// X3DH prepends 32 `0xFF` bytes to the DH outputs (domain separation from
/// XEdDSA, per the X3DH paper).
const X3DH_PREFIX: [u8; 32] = [0xFF; 32];
const ZERO_SALT: [u8; 32] = [0u8; 32];

const X3DH_INFO: &[u8] = b"ParleyX3DH";
const RATCHET_INFO: &[u8] = b"ParleyRatchet";
const MESSAGE_KEYS_INFO: &[u8] = b"ParleyMessageKeys";

const MESSAGE_KEY_SEED: &[u8] = &[0x01];
const CHAIN_KEY_SEED: &[u8] = &[0x02];

/// Shortest accepted X3DH input. A real handshake feeds 96 bytes (three DH
/// outputs) or 128 bytes (with a one-time prekey).
pub const MIN_X3DH_SECRET_LEN: usize = 64;

pub const AES_KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;

macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, ZeroizeOnDrop)]
        pub struct $name([u8; 32]);

        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                bool::from(self.0.ct_eq(&other.0))
            }
        }

        impl Eq for $name {}

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&"***").finish()
            }
        }
    };
}

secret_key!(
    /// Evolves with each DH ratchet step.
    RootKey
);
secret_key!(
    /// Evolves with each message in one direction.
    ChainKey
);
secret_key!(
    /// One-time key for exactly one message.
    MessageKey
);

/// AES-256-GCM key and IV expanded from a [`MessageKey`].
#[derive(ZeroizeOnDrop)]
pub struct MessageEncryptionKeys {
    aes_key: [u8; AES_KEY_LEN],
    iv: [u8; IV_LEN],
}

impl MessageEncryptionKeys {
    pub fn aes_key(&self) -> &[u8; AES_KEY_LEN] {
        &self.aes_key
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }
}

/// Concatenate byte buffers in order. Empty lists and empty buffers are fine.
pub fn concatenate(buffers: &[&[u8]]) -> Vec<u8> {
    let len = buffers.iter().map(|b| b.len()).sum();
    let mut out = Vec::with_capacity(len);
    for buffer in buffers {
        out.extend_from_slice(buffer);
    }
    out
}

/// Derives root, chain, message, and encryption keys through a [`CryptoProvider`].
pub struct KeyDerivation<'a> {
    provider: &'a dyn CryptoProvider,
}

impl<'a> KeyDerivation<'a> {
    pub fn new(provider: &'a dyn CryptoProvider) -> Self {
        Self { provider }
    }

    /// Turn the concatenated X3DH DH outputs into the initial root and chain keys.
    pub fn derive_x3dh_keys(
        &self,
        shared_secret: &[u8],
    ) -> Result<(RootKey, ChainKey), CryptoError> {
        if shared_secret.len() < MIN_X3DH_SECRET_LEN {
            return Err(CryptoError::InvalidInput(format!(
                "X3DH shared secret is {} bytes, need at least {MIN_X3DH_SECRET_LEN}",
                shared_secret.len()
            )));
        }
        let ikm = Zeroizing::new(concatenate(&[&X3DH_PREFIX, shared_secret]));
        let okm = self.expand(&ikm, &ZERO_SALT, X3DH_INFO, 64)?;
        let (root, chain) = split_pair(&okm)?;
        Ok((RootKey(root), ChainKey(chain)))
    }

    /// One DH-ratchet step: mix a fresh DH output into the root key.
    pub fn derive_ratchet_keys(
        &self,
        root_key: &RootKey,
        dh_output: &[u8],
    ) -> Result<(RootKey, ChainKey), CryptoError> {
        let okm = self.expand(dh_output, root_key.as_bytes(), RATCHET_INFO, 64)?;
        let (root, chain) = split_pair(&okm)?;
        Ok((RootKey(root), ChainKey(chain)))
    }

    /// Symmetric-key ratchet step. Returns `(message_key, next_chain_key)`.
    pub fn advance_chain_key(
        &self,
        chain_key: &ChainKey,
    ) -> Result<(MessageKey, ChainKey), CryptoError> {
        let message_key = self.provider.hmac_sha256(chain_key.as_bytes(), MESSAGE_KEY_SEED)?;
        let next_chain_key = self.provider.hmac_sha256(chain_key.as_bytes(), CHAIN_KEY_SEED)?;
        Ok((MessageKey(message_key), ChainKey(next_chain_key)))
    }

    pub fn derive_message_encryption_keys(
        &self,
        message_key: &MessageKey,
    ) -> Result<MessageEncryptionKeys, CryptoError> {
        let okm = self.expand(
            message_key.as_bytes(),
            &ZERO_SALT,
            MESSAGE_KEYS_INFO,
            AES_KEY_LEN + IV_LEN,
        )?;
        let mut keys = MessageEncryptionKeys {
            aes_key: [0u8; AES_KEY_LEN],
            iv: [0u8; IV_LEN],
        };
        keys.aes_key.copy_from_slice(&okm[..AES_KEY_LEN]);
        keys.iv.copy_from_slice(&okm[AES_KEY_LEN..]);
        Ok(keys)
    }

    fn expand(
        &self,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let okm = self.provider.hkdf_derive(ikm, salt, info, len)?;
        if okm.len() != len {
            return Err(CryptoError::KeyDerivation(format!(
                "provider returned {} bytes, expected {len}",
                okm.len()
            )));
        }
        Ok(okm)
    }
}

fn split_pair(okm: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let (first, second) = okm.split_at(okm.len().min(32));
    let first = <[u8; 32]>::try_from(first)
        .map_err(|_| CryptoError::KeyDerivation("short key material".into()))?;
    let second = <[u8; 32]>::try_from(second)
        .map_err(|_| CryptoError::KeyDerivation("short key material".into()))?;
    Ok((first, second))
}
