use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::identity::X25519KeyPair;
use crate::kdf::{ChainKey, MessageKey, RootKey};

/// Encoded size of a [`MessageHeader`].
pub const HEADER_LEN: usize = 40;

/// How many finished receiving chains a session remembers for replay checks.
pub const MAX_PREVIOUS_CHAINS: usize = 5;

/// Sent alongside every ciphertext so the receiver can ratchet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current ratchet public key.
    pub ratchet_key: [u8; 32],
    /// Length of the sender's previous sending chain.
    pub previous_chain_length: u32,
    /// Index of this message in the current sending chain.
    pub message_number: u32,
}

impl MessageHeader {
    /// `ratchet_key (32) || previous_chain_length (4 LE) || message_number (4 LE)`.
    ///
    /// Also used as the AEAD associated data, binding the header to the body.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..32].copy_from_slice(&self.ratchet_key);
        buf[32..36].copy_from_slice(&self.previous_chain_length.to_le_bytes());
        buf[36..].copy_from_slice(&self.message_number.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes = <&[u8; HEADER_LEN]>::try_from(bytes).map_err(|_| {
            CryptoError::InvalidInput(format!(
                "message header must be {HEADER_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        let mut ratchet_key = [0u8; 32];
        ratchet_key.copy_from_slice(&bytes[..32]);
        let mut previous = [0u8; 4];
        previous.copy_from_slice(&bytes[32..36]);
        let mut number = [0u8; 4];
        number.copy_from_slice(&bytes[36..]);
        Ok(Self {
            ratchet_key,
            previous_chain_length: u32::from_le_bytes(previous),
            message_number: u32::from_le_bytes(number),
        })
    }
}

/// Identifies a skipped message key: the ratchet key of its chain and its
/// position in that chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SkippedKeyId {
    pub ratchet_key: [u8; 32],
    pub message_number: u32,
}

/// Message keys derived ahead of time for messages that have not arrived yet.
///
/// Bounded: inserting past the capacity evicts the oldest entries. Entries
/// are removed as soon as they are consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkippedMessageKeys {
    keys: HashMap<SkippedKeyId, MessageKey>,
    order: VecDeque<SkippedKeyId>,
}

impl SkippedMessageKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, id: &SkippedKeyId) -> bool {
        self.keys.contains_key(id)
    }

    /// Store a key, evicting the oldest entries beyond `capacity`.
    /// Returns how many entries were evicted.
    pub fn insert(&mut self, id: SkippedKeyId, key: MessageKey, capacity: usize) -> usize {
        if self.keys.insert(id, key).is_none() {
            self.order.push_back(id);
        }
        let mut evicted = 0;
        while self.keys.len() > capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.keys.remove(&oldest);
            evicted += 1;
        }
        evicted
    }

    /// Remove and return a key. A key can be taken at most once.
    pub fn take(&mut self, id: &SkippedKeyId) -> Option<MessageKey> {
        let key = self.keys.remove(id)?;
        self.order.retain(|entry| entry != id);
        Some(key)
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = (&SkippedKeyId, &MessageKey)> {
        self.order
            .iter()
            .filter_map(|id| self.keys.get_key_value(id))
    }
}

/// A receiving chain that was closed by a DH-ratchet step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviousChain {
    /// The remote ratchet key of the closed chain.
    pub ratchet_key: [u8; 32],
    /// Receive counter when the chain was closed. Every message number below
    /// it was either consumed or cached as a skipped key.
    pub final_counter: u32,
}

/// Full state of one Double Ratchet session between a local device and one
/// remote device.
///
/// A value type: every engine operation takes `&SessionState` and returns a
/// new one. The caller persists the new state and drops the old.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub(crate) remote_user_id: String,
    pub(crate) remote_device_id: String,
    pub(crate) remote_identity_key: [u8; 32],
    /// The initiator's X3DH ephemeral key. Identifies the initial message
    /// this session was built from.
    pub(crate) base_key: [u8; 32],
    /// Our current ratchet key pair.
    pub(crate) dh_key_pair: X25519KeyPair,
    /// Their current ratchet public key, once known.
    pub(crate) remote_ratchet_key: Option<[u8; 32]>,
    pub(crate) root_key: RootKey,
    pub(crate) sending_chain_key: Option<ChainKey>,
    pub(crate) receiving_chain_key: Option<ChainKey>,
    /// Responder only: the X3DH chain key, bound to the receiving chain when
    /// the initiator's first message arrives.
    pub(crate) pending_chain_key: Option<ChainKey>,
    pub(crate) send_message_number: u32,
    pub(crate) receive_message_number: u32,
    pub(crate) previous_chain_length: u32,
    pub(crate) skipped_message_keys: SkippedMessageKeys,
    /// Closed receiving chains, oldest first, at most [`MAX_PREVIOUS_CHAINS`].
    pub(crate) previous_chains: VecDeque<PreviousChain>,
    /// Unix milliseconds of the last encrypt/decrypt.
    pub(crate) last_active: u64,
}

impl SessionState {
    pub fn remote_user_id(&self) -> &str {
        &self.remote_user_id
    }

    pub fn remote_device_id(&self) -> &str {
        &self.remote_device_id
    }

    pub fn remote_identity_key(&self) -> &[u8; 32] {
        &self.remote_identity_key
    }

    pub fn base_key(&self) -> &[u8; 32] {
        &self.base_key
    }

    pub fn dh_public_key(&self) -> &[u8; 32] {
        self.dh_key_pair.public_key()
    }

    pub fn remote_ratchet_key(&self) -> Option<&[u8; 32]> {
        self.remote_ratchet_key.as_ref()
    }

    pub fn root_key(&self) -> &RootKey {
        &self.root_key
    }

    pub fn sending_chain_key(&self) -> Option<&ChainKey> {
        self.sending_chain_key.as_ref()
    }

    pub fn receiving_chain_key(&self) -> Option<&ChainKey> {
        self.receiving_chain_key.as_ref()
    }

    pub fn send_message_number(&self) -> u32 {
        self.send_message_number
    }

    pub fn receive_message_number(&self) -> u32 {
        self.receive_message_number
    }

    pub fn previous_chain_length(&self) -> u32 {
        self.previous_chain_length
    }

    pub fn skipped_message_keys(&self) -> &SkippedMessageKeys {
        &self.skipped_message_keys
    }

    pub fn last_active(&self) -> u64 {
        self.last_active
    }

    /// The closed receiving chain for `ratchet_key`, if it is still remembered.
    pub fn previous_chain(&self, ratchet_key: &[u8; 32]) -> Option<&PreviousChain> {
        self.previous_chains
            .iter()
            .find(|chain| &chain.ratchet_key == ratchet_key)
    }

    /// Record a closed receiving chain, forgetting the oldest past the limit.
    pub(crate) fn close_receiving_chain(&mut self, ratchet_key: [u8; 32], final_counter: u32) {
        self.previous_chains.push_back(PreviousChain {
            ratchet_key,
            final_counter,
        });
        while self.previous_chains.len() > MAX_PREVIOUS_CHAINS {
            self.previous_chains.pop_front();
        }
    }

    /// Whether this session can encrypt right now. A responder session cannot
    /// until the initiator's first message has been decrypted.
    pub fn can_send(&self) -> bool {
        self.sending_chain_key.is_some()
    }
}
