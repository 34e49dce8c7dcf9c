//! Binary persistence format for [`SessionState`].
//!
//! Little-endian, versioned, length-prefixed. Skipped message keys are
//! written oldest first so eviction order survives a round trip, and so are
//! closed receiving chains.

use std::collections::VecDeque;

use crate::error::CryptoError;
use crate::identity::X25519KeyPair;
use crate::kdf::{ChainKey, MessageKey, RootKey};
use crate::signal::state::{
    PreviousChain, SessionState, SkippedKeyId, SkippedMessageKeys, MAX_PREVIOUS_CHAINS,
};

const FORMAT_VERSION: u8 = 2;

const ABSENT: u8 = 0;
const PRESENT: u8 = 1;

impl SessionState {
    /// Encode every field, including skipped message keys.
    ///
    /// The output holds private key material; encrypt it before it leaves
    /// the device.
    pub fn serialize(&self) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::with_capacity(320 + self.skipped_message_keys.len() * 68);
        out.push(FORMAT_VERSION);
        put_str(&mut out, &self.remote_user_id)?;
        put_str(&mut out, &self.remote_device_id)?;
        out.extend_from_slice(&self.remote_identity_key);
        out.extend_from_slice(self.dh_key_pair.public_key());
        out.extend_from_slice(self.dh_key_pair.private_key());
        out.extend_from_slice(self.root_key.as_bytes());
        out.extend_from_slice(&self.base_key);
        put_optional(&mut out, self.sending_chain_key.as_ref().map(ChainKey::as_bytes));
        put_optional(&mut out, self.receiving_chain_key.as_ref().map(ChainKey::as_bytes));
        put_optional(&mut out, self.pending_chain_key.as_ref().map(ChainKey::as_bytes));
        put_optional(&mut out, self.remote_ratchet_key.as_ref());
        out.extend_from_slice(&self.send_message_number.to_le_bytes());
        out.extend_from_slice(&self.receive_message_number.to_le_bytes());
        out.extend_from_slice(&self.previous_chain_length.to_le_bytes());
        out.extend_from_slice(&self.last_active.to_le_bytes());

        put_len(&mut out, self.skipped_message_keys.len())?;
        for (id, key) in self.skipped_message_keys.iter() {
            out.extend_from_slice(&id.ratchet_key);
            out.extend_from_slice(&id.message_number.to_le_bytes());
            out.extend_from_slice(key.as_bytes());
        }

        put_len(&mut out, self.previous_chains.len())?;
        for chain in &self.previous_chains {
            out.extend_from_slice(&chain.ratchet_key);
            out.extend_from_slice(&chain.final_counter.to_le_bytes());
        }
        Ok(out)
    }

    /// Decode a session written by [`SessionState::serialize`].
    pub fn deserialize(data: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = Reader::new(data);

        let version = reader.u8()?;
        if version != FORMAT_VERSION {
            return Err(CryptoError::SessionCorrupted(format!(
                "unsupported session format version {version}"
            )));
        }

        let remote_user_id = reader.string()?;
        let remote_device_id = reader.string()?;
        let remote_identity_key = reader.array32()?;

        let dh_public = reader.array32()?;
        let dh_key_pair = X25519KeyPair::from_private_bytes(reader.array32()?);
        if dh_key_pair.public_key() != &dh_public {
            return Err(CryptoError::SessionCorrupted(
                "ratchet private key does not match its public key".into(),
            ));
        }

        let root_key = RootKey::from_bytes(reader.array32()?);
        let base_key = reader.array32()?;
        let sending_chain_key = reader.optional()?.map(ChainKey::from_bytes);
        let receiving_chain_key = reader.optional()?.map(ChainKey::from_bytes);
        let pending_chain_key = reader.optional()?.map(ChainKey::from_bytes);
        let remote_ratchet_key = reader.optional()?;
        let send_message_number = reader.u32()?;
        let receive_message_number = reader.u32()?;
        let previous_chain_length = reader.u32()?;
        let last_active = reader.u64()?;

        let count = reader.u32()?;
        let mut skipped_message_keys = SkippedMessageKeys::new();
        for _ in 0..count {
            let id = SkippedKeyId {
                ratchet_key: reader.array32()?,
                message_number: reader.u32()?,
            };
            if skipped_message_keys.contains(&id) {
                return Err(CryptoError::SessionCorrupted(
                    "duplicate skipped message key".into(),
                ));
            }
            let key = MessageKey::from_bytes(reader.array32()?);
            skipped_message_keys.insert(id, key, usize::MAX);
        }

        let count = reader.u32()?;
        if !usize::try_from(count).is_ok_and(|count| count <= MAX_PREVIOUS_CHAINS) {
            return Err(CryptoError::SessionCorrupted(format!(
                "{count} closed receiving chains exceed the limit of {MAX_PREVIOUS_CHAINS}"
            )));
        }
        let mut previous_chains = VecDeque::new();
        for _ in 0..count {
            previous_chains.push_back(PreviousChain {
                ratchet_key: reader.array32()?,
                final_counter: reader.u32()?,
            });
        }

        reader.finish()?;

        Ok(Self {
            remote_user_id,
            remote_device_id,
            remote_identity_key,
            base_key,
            dh_key_pair,
            remote_ratchet_key,
            root_key,
            sending_chain_key,
            receiving_chain_key,
            pending_chain_key,
            send_message_number,
            receive_message_number,
            previous_chain_length,
            skipped_message_keys,
            previous_chains,
            last_active,
        })
    }
}

fn put_len(out: &mut Vec<u8>, len: usize) -> Result<(), CryptoError> {
    let len = u32::try_from(len)
        .map_err(|_| CryptoError::InvalidInput(format!("length {len} does not fit in u32")))?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn put_str(out: &mut Vec<u8>, value: &str) -> Result<(), CryptoError> {
    put_len(out, value.len())?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_optional(out: &mut Vec<u8>, value: Option<&[u8; 32]>) {
    match value {
        Some(bytes) => {
            out.push(PRESENT);
            out.extend_from_slice(bytes);
        }
        None => out.push(ABSENT),
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CryptoError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                CryptoError::SessionCorrupted(format!("truncated at byte {}", self.pos))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CryptoError> {
        let bytes = self.take(N)?;
        <[u8; N]>::try_from(bytes)
            .map_err(|_| CryptoError::SessionCorrupted("short field".into()))
    }

    fn array32(&mut self) -> Result<[u8; 32], CryptoError> {
        self.array::<32>()
    }

    fn u8(&mut self) -> Result<u8, CryptoError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, CryptoError> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }

    fn u64(&mut self) -> Result<u64, CryptoError> {
        Ok(u64::from_le_bytes(self.array::<8>()?))
    }

    fn string(&mut self) -> Result<String, CryptoError> {
        let len = usize::try_from(self.u32()?)
            .map_err(|_| CryptoError::SessionCorrupted("string length overflow".into()))?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CryptoError::SessionCorrupted(format!("invalid UTF-8: {e}")))
    }

    fn optional(&mut self) -> Result<Option<[u8; 32]>, CryptoError> {
        match self.u8()? {
            ABSENT => Ok(None),
            PRESENT => Ok(Some(self.array32()?)),
            flag => Err(CryptoError::SessionCorrupted(format!(
                "invalid presence flag {flag}"
            ))),
        }
    }

    fn finish(&self) -> Result<(), CryptoError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(CryptoError::SessionCorrupted(format!(
                "{} trailing bytes",
                self.data.len() - self.pos
            )))
        }
    }
}
