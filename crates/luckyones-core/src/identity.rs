//! Identifier newtypes.
//!
//! The core treats all of these as opaque comparable values.

use std::fmt;

use luckyones_crypto::PublicKey;
use sha2::{Digest, Sha256};

/// Stable participant identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(pub u64);

impl ParticipantId {
    /// Creator recorded for the main thread.
    pub const SYSTEM: Self = Self(0);

    /// Derive an id from a long-term public key: the first eight bytes of
    /// its SHA-256 digest.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(prefix))
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u128);

impl ThreadId {
    /// The network-wide thread every participant belongs to.
    pub const MAIN: Self = Self(0);

    /// True for the main thread.
    pub fn is_main(self) -> bool {
        self == Self::MAIN
    }

    /// Big-endian bytes, used as session context.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_main() { write!(f, "main") } else { write!(f, "{:032x}", self.0) }
    }
}

/// Attachment identifier, shared by every recipient's copy of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentId(pub u128);

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}
