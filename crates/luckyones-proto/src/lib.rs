//! LuckyOnes Wire Protocol
//!
//! Every protocol event travels as a [`Frame`]: a fixed 48-byte binary
//! [`FrameHeader`] followed by a CBOR-encoded [`Payload`]. The header carries
//! everything needed for routing (opcode, thread, sender, recipient), so a
//! relay can forward MESSAGE and IMAGE frames without decoding them.
//!
//! The opcode is the variant tag of the envelope. Unknown opcodes are
//! rejected at decode time with [`ProtocolError::UnknownOpcode`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod errors;
pub mod frame;
pub mod header;
pub mod opcode;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use opcode::Opcode;
pub use payloads::{
    ErrorPayload, Payload,
    message::{EncryptedImage, EncryptedMessage, WireRatchetHeader},
    presence::{Join, Leave, ParticipantInfo, UserList},
    thread::{CreateThread, DeleteReason, DeleteThread, ThreadList, ThreadSummary, WireThreadKind},
};
