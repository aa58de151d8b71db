//! Error types for cryptographic operations

use thiserror::Error;

/// Errors from key exchange, AEAD and ratchet operations.
///
/// None of these are process-fatal. The worst outcome is dropping one
/// message or one session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Remote public key is not usable for key agreement
    #[error("invalid public key: {reason}")]
    InvalidKey {
        /// Why the key was rejected
        reason: &'static str,
    },

    /// AEAD tag mismatch (wrong key, tampered ciphertext or tampered context)
    #[error("authentication failed")]
    Authentication,

    /// Message key for this counter was already consumed
    #[error("duplicate message: counter {counter} already consumed")]
    Duplicate {
        /// Counter from the offending header
        counter: u32,
    },

    /// Counter is too far ahead of the receiving chain to process now
    #[error("message deferred: counter {counter} is {gap} steps ahead (limit {limit})")]
    Deferred {
        /// Counter from the offending header
        counter: u32,
        /// Number of keys that would have to be skipped
        gap: u32,
        /// Configured skip limit
        limit: u32,
    },

    /// Message arrived on a ratchet key we have no receiving chain for
    #[error("no receiving chain for ratchet key")]
    NoReceivingChain,

    /// Sending chain exhausted its counter space
    #[error("sending counter overflow at {current}")]
    CounterOverflow {
        /// Counter when overflow was detected
        current: u32,
    },
}

impl CryptoError {
    /// Returns true if the same message may succeed later.
    ///
    /// Only [`CryptoError::Deferred`] qualifies: once the gap closes (earlier
    /// messages arrive) the message can be retried by the transport.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Deferred { .. } => true,

            Self::InvalidKey { .. }
            | Self::Authentication
            | Self::Duplicate { .. }
            | Self::NoReceivingChain
            | Self::CounterOverflow { .. } => false,
        }
    }

    /// Returns true if the message should be dropped without telling the user.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_is_transient() {
        let err = CryptoError::Deferred { counter: 2000, gap: 2000, limit: 1000 };
        assert!(err.is_transient());
    }

    #[test]
    fn authentication_is_not_transient() {
        assert!(!CryptoError::Authentication.is_transient());
        assert!(!CryptoError::Authentication.is_silent());
    }

    #[test]
    fn duplicate_is_silent() {
        assert!(CryptoError::Duplicate { counter: 0 }.is_silent());
    }

    #[test]
    fn error_display() {
        let err = CryptoError::Deferred { counter: 1500, gap: 1500, limit: 1000 };
        assert_eq!(
            err.to_string(),
            "message deferred: counter 1500 is 1500 steps ahead (limit 1000)"
        );
    }
}
