//! Error types for the messaging core.
//!
//! One enum covers router, engine and registry failures. Every variant
//! describes a single rejected operation: none of them invalidates the
//! router, another session or another thread.

use luckyones_crypto::CryptoError;
use luckyones_proto::ProtocolError;
use thiserror::Error;

use crate::{
    identity::{ParticipantId, ThreadId},
    thread::Admission,
};

/// Errors from core operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Key agreement, AEAD or ratchet failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Malformed frame or payload
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No session with this peer in this thread
    #[error("no session with {peer} in thread {thread}")]
    NoSession {
        /// Thread
        thread: ThreadId,
        /// Remote participant
        peer: ParticipantId,
    },

    /// Participant has not announced a public key
    #[error("unknown participant {0}")]
    UnknownParticipant(ParticipantId),

    /// Thread id already in use
    #[error("thread {0} already exists")]
    ThreadExists(ThreadId),

    /// Thread policy refused the operation
    #[error("rejected in thread {thread}: {admission:?}")]
    Rejected {
        /// Thread
        thread: ThreadId,
        /// Policy outcome
        admission: Admission,
    },

    /// Operation not permitted for this participant or thread
    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    /// Configured thread lifetime is zero
    #[error("thread lifetime must be positive")]
    InvalidLifetime,
}

impl CoreError {
    /// Returns true if the message should be dropped without a notice.
    ///
    /// Replays are expected on lossy transports and are only logged.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Crypto(err) if err.is_silent())
    }

    /// Returns true if the same input may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Crypto(err) => err.is_transient(),
            Self::UnknownParticipant(_) | Self::NoSession { .. } => true,
            Self::Protocol(_)
            | Self::ThreadExists(_)
            | Self::Rejected { .. }
            | Self::Forbidden(_)
            | Self::InvalidLifetime => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_is_silent() {
        let err = CoreError::from(CryptoError::Duplicate { counter: 3 });
        assert!(err.is_silent());
        assert!(!err.is_transient());
    }

    #[test]
    fn authentication_is_reported() {
        let err = CoreError::from(CryptoError::Authentication);
        assert!(!err.is_silent());
    }

    #[test]
    fn unknown_participant_is_transient() {
        let err = CoreError::UnknownParticipant(ParticipantId(9));
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "unknown participant 0000000000000009");
    }
}
