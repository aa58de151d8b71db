//! CBOR-encoded protocol payloads.
//!
//! Frame headers are raw binary for routing, payloads are CBOR for type
//! safety. The opcode in the header is the variant tag: only the inner
//! struct is serialized, and decoding dispatches on the opcode.
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one opcode (enforced by match
//! exhaustiveness). Decoded payloads have passed field validation.

pub mod message;
pub mod presence;
pub mod thread;

use bytes::BufMut;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All possible frame payloads
///
/// # Security
///
/// - No Variant Tag: the frame header's opcode identifies the payload type,
///   so a payload cannot claim a different kind than its frame.
/// - Validated on receipt: [`Payload::decode`] rejects unknown opcodes and
///   out-of-range fields instead of ignoring them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    // Presence
    /// Participant announcement
    Join(presence::Join),
    /// Participant departure
    Leave(presence::Leave),
    /// Connected participants snapshot
    UserList(presence::UserList),

    // Content
    /// Encrypted text
    Message(message::EncryptedMessage),
    /// Encrypted image
    Image(message::EncryptedImage),

    // Threads
    /// Thread announcement
    CreateThread(thread::CreateThread),
    /// Thread removal
    DeleteThread(thread::DeleteThread),
    /// Visible threads snapshot
    ThreadList(thread::ThreadList),

    // Error frame
    /// Error response
    Error(ErrorPayload),
}

/// Error payload for error frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code identifying the type of error.
    pub code: u16,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorPayload {
    /// Sender is not a member of the target thread.
    pub const NOT_MEMBER: u16 = 0x0001;
    /// Target thread has expired or does not exist.
    pub const EXPIRED: u16 = 0x0002;
    /// Invalid payload format.
    pub const INVALID_PAYLOAD: u16 = 0x0003;
    /// Recipient is not connected or not a member.
    pub const UNKNOWN_RECIPIENT: u16 = 0x0004;
    /// Operation not permitted for this sender.
    pub const FORBIDDEN: u16 = 0x0005;
    /// Thread id already in use.
    pub const THREAD_EXISTS: u16 = 0x0006;

    /// Create a not-member rejection.
    pub fn not_member(thread_id: u128) -> Self {
        Self { code: Self::NOT_MEMBER, message: format!("not a member of thread {thread_id:032x}") }
    }

    /// Create an expired-thread rejection.
    pub fn expired(thread_id: u128) -> Self {
        Self { code: Self::EXPIRED, message: format!("thread {thread_id:032x} has expired") }
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self { code: Self::INVALID_PAYLOAD, message: msg.into() }
    }

    /// Create an unknown recipient error.
    pub fn unknown_recipient(recipient: u64) -> Self {
        Self { code: Self::UNKNOWN_RECIPIENT, message: format!("unknown recipient {recipient}") }
    }

    /// Create a forbidden-operation error.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self { code: Self::FORBIDDEN, message: msg.into() }
    }

    /// Create a thread-exists error.
    pub fn thread_exists(thread_id: u128) -> Self {
        Self {
            code: Self::THREAD_EXISTS,
            message: format!("thread {thread_id:032x} already exists"),
        }
    }
}

impl Payload {
    /// Opcode corresponding to this payload type.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Join(_) => Opcode::Join,
            Self::Leave(_) => Opcode::Leave,
            Self::UserList(_) => Opcode::UserList,
            Self::Message(_) => Opcode::Message,
            Self::Image(_) => Opcode::Image,
            Self::CreateThread(_) => Opcode::CreateThread,
            Self::DeleteThread(_) => Opcode::DeleteThread,
            Self::ThreadList(_) => Opcode::ThreadList,
            Self::Error(_) => Opcode::Error,
        }
    }

    /// Encode payload to buffer
    ///
    /// Serializes only the inner struct, NOT the variant tag.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Join(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Leave(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::UserList(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Message(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Image(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::CreateThread(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::DeleteThread(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ThreadList(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Error(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode payload from bytes based on opcode
    ///
    /// The size check happens BEFORE CBOR parsing begins.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if bytes exceed `MAX_PAYLOAD_SIZE`
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    /// - `ProtocolError::InvalidField` if a field violates protocol limits
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        let payload = match opcode {
            Opcode::Join => {
                let join: presence::Join = from_cbor(bytes)?;
                join.validate()?;
                Self::Join(join)
            },
            Opcode::Leave => Self::Leave(from_cbor(bytes)?),
            Opcode::UserList => {
                let list: presence::UserList = from_cbor(bytes)?;
                list.validate()?;
                Self::UserList(list)
            },
            Opcode::Message => {
                let message: message::EncryptedMessage = from_cbor(bytes)?;
                message.validate()?;
                Self::Message(message)
            },
            Opcode::Image => {
                let image: message::EncryptedImage = from_cbor(bytes)?;
                image.validate()?;
                Self::Image(image)
            },
            Opcode::CreateThread => {
                let create: thread::CreateThread = from_cbor(bytes)?;
                create.validate()?;
                Self::CreateThread(create)
            },
            Opcode::DeleteThread => Self::DeleteThread(from_cbor(bytes)?),
            Opcode::ThreadList => {
                let list: thread::ThreadList = from_cbor(bytes)?;
                list.validate()?;
                Self::ThreadList(list)
            },
            Opcode::Error => Self::Error(from_cbor(bytes)?),
        };

        Ok(payload)
    }

    /// Convert payload into a transport frame
    ///
    /// Encodes the payload and stamps its opcode into `header`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn into_frame(self, mut header: FrameHeader) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        header.opcode = self.opcode().to_u16().to_be_bytes();
        Ok(Frame::new(header, buf))
    }

    /// Parse payload from a raw transport frame
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownOpcode` if the header opcode is not recognized
    /// - see [`Payload::decode`]
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or(ProtocolError::UnknownOpcode(frame.header.opcode()))?;
        Self::decode(opcode, &frame.payload)
    }
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}
