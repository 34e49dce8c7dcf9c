//! Human-comparable fingerprints of two identity keys.
//!
//! Each party contributes 30 digits derived from iterated SHA-512 over its
//! own `(user id, identity key)`. The two halves are ordered canonically, so
//! both devices display the same 60 digits.

use sha2::{Digest, Sha512};

const FINGERPRINT_VERSION: u16 = 0;
const ITERATIONS: usize = 5200;
const CHUNKS_PER_PARTY: usize = 6;
const CHUNK_BYTES: usize = 5;
const CHUNK_MODULUS: u64 = 100_000;

/// Number of digits in a safety number.
pub const SAFETY_NUMBER_DIGITS: usize = 60;

const GROUP_LEN: usize = 5;
const GROUPS_PER_LINE: usize = 4;

/// Derive the 60-digit safety number for a conversation.
///
/// Swapping the local and remote arguments gives the same result.
pub fn generate(
    local_user_id: &str,
    local_identity_key: &[u8; 32],
    remote_user_id: &str,
    remote_identity_key: &[u8; 32],
) -> String {
    let local = party_digits(local_user_id, local_identity_key);
    let remote = party_digits(remote_user_id, remote_identity_key);

    if local <= remote {
        local + &remote
    } else {
        remote + &local
    }
}

/// Lay out a safety number for display: groups of five digits separated by
/// spaces, four groups per line. Whitespace in `raw` is ignored, so the
/// output can be formatted again or stripped back to the digits.
pub fn format(raw: &str) -> String {
    let digits: Vec<char> = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let mut out = String::with_capacity(digits.len() + digits.len() / GROUP_LEN);

    for (i, group) in digits.chunks(GROUP_LEN).enumerate() {
        if i > 0 {
            out.push(if i % GROUPS_PER_LINE == 0 { '\n' } else { ' ' });
        }
        out.extend(group);
    }
    out
}

fn party_digits(user_id: &str, identity_key: &[u8; 32]) -> String {
    let mut hash = Vec::with_capacity(2 + identity_key.len() + user_id.len());
    hash.extend_from_slice(&FINGERPRINT_VERSION.to_be_bytes());
    hash.extend_from_slice(identity_key);
    hash.extend_from_slice(user_id.as_bytes());

    for _ in 0..ITERATIONS {
        let mut hasher = Sha512::new();
        hasher.update(&hash);
        hasher.update(identity_key);
        hash = hasher.finalize().to_vec();
    }

    hash.chunks_exact(CHUNK_BYTES)
        .take(CHUNKS_PER_PARTY)
        .map(|chunk| {
            let value = chunk
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
            format!("{:05}", value % CHUNK_MODULUS)
        })
        .collect()
}
