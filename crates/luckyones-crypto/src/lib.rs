//! LuckyOnes Cryptographic Primitives
//!
//! Building blocks for pairwise end-to-end encryption. Everything here is
//! pure: functions that need fresh key material take the bytes from the
//! caller, so a seeded RNG makes every session reproducible in tests.
//!
//! # Key Lifecycle
//!
//! ```text
//! X25519(static, static)
//!        │
//!        ▼
//! HKDF → Session Seed (per participant pair, per thread)
//!        │
//!        ▼
//! Root KDF ◄── X25519(ratchet, ratchet)   (DH ratchet, once per epoch)
//!        │
//!        ▼
//! Chain KDF → Message Keys                (symmetric ratchet, per message)
//!        │
//!        ▼
//! ChaCha20-Poly1305 → Ciphertext
//! ```
//!
//! Raw Diffie-Hellman output never keys the AEAD directly. Every message key
//! is used for one seal/open and then dropped, and every chain key is
//! zeroized as soon as its successor exists.
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain advancement: old chain keys are overwritten after each message
//! - DH ratchet: a new root key is mixed in whenever the peer's ratchet key
//!   changes, bounding the damage of a leaked chain key to one epoch
//!
//! Authenticity:
//! - AEAD tag covers the ratchet header and the routing context
//! - Receive is transactional: a failed tag check leaves the session exactly
//!   as it was
//!
//! Key Confinement:
//! - Low-order X25519 points are rejected with [`CryptoError::InvalidKey`]

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod chain;
pub mod error;
pub mod kdf;
pub mod key_exchange;
pub mod ratchet;
pub mod skipped;

pub use aead::{KEY_SIZE, NONCE_SIZE, TAG_SIZE, open, seal};
pub use chain::{ChainKey, MessageKey};
pub use error::CryptoError;
pub use kdf::{derive_root_step, derive_session_seed};
pub use key_exchange::{KeyPair, PUBLIC_KEY_SIZE, PublicKey, SharedSecret, agree};
pub use ratchet::{RatchetHeader, RatchetSession, ReceivePlan, Role, SessionLimits};
pub use skipped::SkippedKeys;
