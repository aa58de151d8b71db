//! Protocol error types

use thiserror::Error;

/// Result alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors from framing and payload (de)serialization.
///
/// All of these describe one bad frame. None affects the connection's
/// ability to carry the next one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer shorter than the fixed header
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Required length
        expected: usize,
        /// Available length
        actual: usize,
    },

    /// Header magic does not match
    #[error("invalid magic number")]
    InvalidMagic,

    /// Header version is not supported
    #[error("unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Payload exceeds the protocol limit
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Claimed or actual size
        size: usize,
        /// Protocol maximum
        max: usize,
    },

    /// Fewer payload bytes than the header claims
    #[error("frame truncated: expected {expected} payload bytes, got {actual}")]
    FrameTruncated {
        /// Claimed payload size
        expected: usize,
        /// Available payload bytes
        actual: usize,
    },

    /// Opcode is not part of the protocol
    #[error("unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    /// Payload decoded but a field violates protocol limits
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        /// Offending field
        field: &'static str,
        /// Which limit was violated
        reason: &'static str,
    },

    /// CBOR serialization failed
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed or fields are invalid
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}
