//! Primitive cryptographic operations consumed by the protocol engine.
//!
//! Everything above this module talks to [`CryptoProvider`] only, so a host
//! can swap in a hardware-backed or platform-native implementation without
//! touching the key schedule.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::{Ed25519KeyPair, X25519KeyPair};

type HmacSha256 = Hmac<Sha256>;

/// Primitive provider contract: key generation, ECDH, signatures, AEAD, KDF,
/// MAC, and a CSPRNG.
pub trait CryptoProvider: Send + Sync {
    fn generate_x25519_key_pair(&self) -> Result<X25519KeyPair, CryptoError>;

    /// X25519 Diffie-Hellman. `DH(a_priv, b_pub) == DH(b_priv, a_pub)`.
    fn x25519_dh(
        &self,
        private_key: &[u8; 32],
        peer_public_key: &[u8; 32],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError>;

    fn generate_ed25519_key_pair(&self) -> Result<Ed25519KeyPair, CryptoError>;

    /// Deterministic Ed25519 signature with a 32-byte seed.
    fn ed25519_sign(&self, private_key: &[u8; 32], message: &[u8])
        -> Result<[u8; 64], CryptoError>;

    fn ed25519_verify(&self, public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool;

    /// AES-256-GCM with the 16-byte tag appended to the ciphertext.
    fn aes_gcm_encrypt(
        &self,
        key: &[u8; 32],
        iv: &[u8; 12],
        plaintext: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError>;

    fn aes_gcm_decrypt(
        &self,
        key: &[u8; 32],
        iv: &[u8; 12],
        ciphertext: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError>;

    /// HKDF-SHA-256 extract-and-expand.
    fn hkdf_derive(
        &self,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        output_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError>;

    fn secure_random_bytes(&self, len: usize) -> Result<Vec<u8>, CryptoError>;
}

/// Fill a fixed-size array from the provider's CSPRNG.
pub(crate) fn random_array<const N: usize>(
    provider: &dyn CryptoProvider,
) -> Result<[u8; N], CryptoError> {
    let bytes = provider.secure_random_bytes(N)?;
    <[u8; N]>::try_from(bytes.as_slice())
        .map_err(|_| CryptoError::RandomnessError(format!("expected {N} random bytes")))
}

/// [`CryptoProvider`] backed by the RustCrypto and dalek crates.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustCryptoProvider;

impl RustCryptoProvider {
    fn random_seed() -> Result<[u8; 32], CryptoError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(seed)
    }
}

impl CryptoProvider for RustCryptoProvider {
    fn generate_x25519_key_pair(&self) -> Result<X25519KeyPair, CryptoError> {
        let seed = Zeroizing::new(Self::random_seed()?);
        Ok(X25519KeyPair::from_private_bytes(*seed))
    }

    fn x25519_dh(
        &self,
        private_key: &[u8; 32],
        peer_public_key: &[u8; 32],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let secret = StaticSecret::from(*private_key);
        let shared = secret.diffie_hellman(&X25519Public::from(*peer_public_key));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey(
                "peer public key is a low-order point".into(),
            ));
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }

    fn generate_ed25519_key_pair(&self) -> Result<Ed25519KeyPair, CryptoError> {
        let seed = Zeroizing::new(Self::random_seed()?);
        Ok(Ed25519KeyPair::from_private_bytes(*seed))
    }

    fn ed25519_sign(
        &self,
        private_key: &[u8; 32],
        message: &[u8],
    ) -> Result<[u8; 64], CryptoError> {
        let signing_key = SigningKey::from_bytes(private_key);
        Ok(signing_key.sign(message).to_bytes())
    }

    fn ed25519_verify(&self, public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let signature = Signature::from_bytes(signature);
        verifying_key.verify_strict(message, &signature).is_ok()
    }

    fn aes_gcm_encrypt(
        &self,
        key: &[u8; 32],
        iv: &[u8; 12],
        plaintext: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let payload = Payload {
            msg: plaintext,
            aad: aad.unwrap_or_default(),
        };
        cipher
            .encrypt(Nonce::from_slice(iv), payload)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))
    }

    fn aes_gcm_decrypt(
        &self,
        key: &[u8; 32],
        iv: &[u8; 12],
        ciphertext: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let payload = Payload {
            msg: ciphertext,
            aad: aad.unwrap_or_default(),
        };
        cipher
            .decrypt(Nonce::from_slice(iv), payload)
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    fn hkdf_derive(
        &self,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        output_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = Zeroizing::new(vec![0u8; output_len]);
        hk.expand(info, okm.as_mut_slice())
            .map_err(|e| CryptoError::KeyDerivation(format!("HKDF expand failed: {e}")))?;
        Ok(okm)
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }

    fn secure_random_bytes(&self, len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut out)
            .map_err(|e| CryptoError::RandomnessError(e.to_string()))?;
        Ok(out)
    }
}
