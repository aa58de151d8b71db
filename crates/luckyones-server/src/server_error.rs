//! Relay driver error types.

use luckyones_core::{CoreError, ParticipantId};
use luckyones_proto::ProtocolError;
use thiserror::Error;

/// Errors from [`RelayDriver`](crate::RelayDriver) event processing.
///
/// Client mistakes (bad payloads, policy rejections) are answered with an
/// ERROR frame and never surface here. These variants describe runtime
/// inconsistencies the caller should log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Event for a connection the driver does not know.
    ///
    /// Transient if the connection closed concurrently.
    #[error("connection not found: {0}")]
    ConnectionNotFound(u64),

    /// Connection id reused while still registered. Logic bug in the runtime.
    #[error("connection already exists: {0}")]
    ConnectionExists(u64),

    /// Connection sent JOIN twice
    #[error("connection {0} already joined")]
    AlreadyJoined(u64),

    /// Participant is already bound to another connection
    #[error("participant {0} already connected")]
    ParticipantConnected(ParticipantId),

    /// Encoding a reply failed
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Thread bookkeeping failed
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_error_display() {
        assert_eq!(RelayError::ConnectionNotFound(42).to_string(), "connection not found: 42");
        assert_eq!(
            RelayError::ParticipantConnected(ParticipantId(1)).to_string(),
            "participant 0000000000000001 already connected"
        );
    }
}
