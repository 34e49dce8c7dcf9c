use crate::error::CryptoError;
use crate::kdf::{AES_KEY_LEN, IV_LEN};
use crate::provider::CryptoProvider;

/// Length of the AES-GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// AES-256-GCM with input validation in front of the provider.
///
/// Length problems are reported as [`CryptoError::InvalidInput`] before any
/// cryptographic work; a tag mismatch is [`CryptoError::AuthenticationFailed`]
/// and never comes with plaintext.
pub struct AeadCipher<'a> {
    provider: &'a dyn CryptoProvider,
}

impl<'a> AeadCipher<'a> {
    pub fn new(provider: &'a dyn CryptoProvider) -> Self {
        Self { provider }
    }

    /// Returns `plaintext.len() + 16` bytes. Empty plaintext is allowed.
    pub fn encrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        plaintext: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        let (key, iv) = validate_key_and_iv(key, iv)?;
        self.provider.aes_gcm_encrypt(key, iv, plaintext, aad)
    }

    pub fn decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        let (key, iv) = validate_key_and_iv(key, iv)?;
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::InvalidInput(format!(
                "ciphertext is {} bytes, shorter than the {TAG_LEN}-byte tag",
                ciphertext.len()
            )));
        }
        self.provider.aes_gcm_decrypt(key, iv, ciphertext, aad)
    }
}

fn validate_key_and_iv<'k, 'i>(
    key: &'k [u8],
    iv: &'i [u8],
) -> Result<(&'k [u8; AES_KEY_LEN], &'i [u8; IV_LEN]), CryptoError> {
    let key = <&[u8; AES_KEY_LEN]>::try_from(key).map_err(|_| {
        CryptoError::InvalidInput(format!("key must be {AES_KEY_LEN} bytes, got {}", key.len()))
    })?;
    let iv = <&[u8; IV_LEN]>::try_from(iv).map_err(|_| {
        CryptoError::InvalidInput(format!("IV must be {IV_LEN} bytes, got {}", iv.len()))
    })?;
    Ok((key, iv))
}
