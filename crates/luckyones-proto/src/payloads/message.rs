//! End-to-end encrypted content payloads.
//!
//! Relays never decode these. The ratchet header travels in the clear so the
//! receiver can find the right message key; the AEAD binds it to the
//! ciphertext.

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Poly1305 tag length; no valid ciphertext is shorter
pub const MIN_CIPHERTEXT_LEN: usize = 16;

/// Double ratchet header as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRatchetHeader {
    /// Sender's current ratchet public key
    pub ratchet_key: [u8; 32],
    /// Messages in the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Position in the current sending chain
    pub counter: u32,
}

/// Encrypted text message for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// Ratchet header
    pub header: WireRatchetHeader,
    /// Ciphertext including 16-byte tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    pub(crate) fn validate(&self) -> Result<()> {
        validate_ciphertext(&self.ciphertext)
    }
}

/// Encrypted image attachment for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedImage {
    /// Ratchet header
    pub header: WireRatchetHeader,
    /// Attachment id shared by every recipient's copy
    pub attachment_id: u128,
    /// Ciphertext including 16-byte tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedImage {
    pub(crate) fn validate(&self) -> Result<()> {
        validate_ciphertext(&self.ciphertext)
    }
}

fn validate_ciphertext(ciphertext: &[u8]) -> Result<()> {
    if ciphertext.len() < MIN_CIPHERTEXT_LEN {
        return Err(ProtocolError::InvalidField {
            field: "ciphertext",
            reason: "shorter than authentication tag",
        });
    }
    Ok(())
}
