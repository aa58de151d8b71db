//! Symmetric chain for forward-secure message key derivation
//!
//! # Security Properties
//!
//! - Forward Secrecy: the old chain key is overwritten when advancing
//! - Key Uniqueness: each counter produces a unique message key
//! - Determinism: the same chain key always produces the same key sequence

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// A one-time message key.
///
/// Used for exactly one seal or open and then dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct MessageKey {
    key: [u8; 32],
    counter: u32,
}

impl MessageKey {
    /// 32-byte AEAD key.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Chain position this key was derived at.
    pub fn counter(&self) -> u32 {
        self.counter
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageKey").field("counter", &self.counter).finish_non_exhaustive()
    }
}

/// One sending or receiving chain.
///
/// Each [`advance()`](Self::advance) call:
/// 1. Derives a message key from the current chain key
/// 2. Derives the next chain key
/// 3. Overwrites the old chain key
#[derive(Clone)]
pub struct ChainKey {
    key: [u8; 32],
    counter: u32,
}

impl ChainKey {
    /// Start a chain at counter 0.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, counter: 0 }
    }

    /// Counter of the next key this chain will produce.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Produce the key for the current counter and step the chain.
    pub fn advance(&mut self) -> Result<MessageKey, CryptoError> {
        if self.counter == u32::MAX {
            return Err(CryptoError::CounterOverflow { current: self.counter });
        }

        let message_key = self.derive(MESSAGE_LABEL);
        let next_chain_key = self.derive(CHAIN_LABEL);

        self.key.zeroize();
        self.key = next_chain_key;

        let counter = self.counter;
        self.counter += 1;

        Ok(MessageKey { key: message_key, counter })
    }

    /// Advance to `target`, returning the keys for every counter before it
    /// and the key at `target` itself.
    ///
    /// Caller checks the gap against its skip limit first.
    pub fn advance_to(
        &mut self,
        target: u32,
    ) -> Result<(Vec<MessageKey>, MessageKey), CryptoError> {
        let mut skipped = Vec::with_capacity(target.saturating_sub(self.counter) as usize);
        while self.counter < target {
            skipped.push(self.advance()?);
        }
        let key = self.advance()?;
        Ok((skipped, key))
    }

    fn derive(&self, label: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainKey").field("counter", &self.counter).finish_non_exhaustive()
    }
}
