//! End-to-end encryption for Parley: X3DH session setup, the Double Ratchet,
//! and safety numbers for out-of-band identity verification.

pub mod aead;
pub mod config;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod provider;
pub mod safety_number;
pub mod signal;

pub use config::RatchetConfig;
pub use error::{CryptoError, ErrorKind};
pub use identity::{Ed25519KeyPair, IdentityKeyPair, X25519KeyPair};
pub use provider::{CryptoProvider, RustCryptoProvider};
pub use signal::{SessionManager, SessionState, SignalProtocolEngine};
