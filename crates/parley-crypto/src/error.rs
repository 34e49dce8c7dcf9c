use thiserror::Error;

/// Coarse classification of a [`CryptoError`], used by callers to decide how
/// to surface a failure (e.g. "message cannot be verified" vs. a bug report).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wrong key, IV, or ciphertext length. Raised before any crypto runs.
    InputValidation,
    /// Tag mismatch, bad prekey signature, or a changed identity key.
    Authentication,
    /// The operation cannot run against this session; the session stays valid.
    ProtocolState,
    /// A message number that was already consumed.
    Replay,
    /// Provider, randomness, or persistence failure.
    Internal,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("message cannot be verified")]
    AuthenticationFailed,

    #[error("invalid prekey signature")]
    InvalidPreKeySignature,

    #[error("identity key for {0} has changed")]
    UntrustedIdentity(String),

    #[error("session has no sending chain")]
    NoSendingChain,

    #[error("no message key for message {message_number} of ratchet key {ratchet_key}")]
    MissingMessageKey {
        ratchet_key: String,
        message_number: u32,
    },

    #[error("message {message_number} was already received")]
    ReplayedMessage { message_number: u32 },

    #[error("initial message already accepted for {0}")]
    DuplicateInitialMessage(String),

    #[error("too many skipped messages: {requested} exceeds limit of {limit}")]
    TooManySkippedMessages { requested: u32, limit: u32 },

    #[error("prekey error: {0}")]
    PreKeyError(String),

    #[error("no session for {0}")]
    SessionNotFound(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("randomness unavailable: {0}")]
    RandomnessError(String),

    #[error("session state corrupted: {0}")]
    SessionCorrupted(String),

    #[error("key storage error: {0}")]
    StorageError(String),
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) | Self::InvalidKey(_) => ErrorKind::InputValidation,
            Self::AuthenticationFailed
            | Self::InvalidPreKeySignature
            | Self::UntrustedIdentity(_) => ErrorKind::Authentication,
            Self::NoSendingChain
            | Self::MissingMessageKey { .. }
            | Self::TooManySkippedMessages { .. }
            | Self::PreKeyError(_)
            | Self::SessionNotFound(_) => ErrorKind::ProtocolState,
            Self::ReplayedMessage { .. } | Self::DuplicateInitialMessage(_) => ErrorKind::Replay,
            Self::KeyGeneration(_)
            | Self::KeyDerivation(_)
            | Self::EncryptionError(_)
            | Self::RandomnessError(_)
            | Self::SessionCorrupted(_)
            | Self::StorageError(_) => ErrorKind::Internal,
        }
    }
}
