//! Frame header with zero-copy parsing.
//!
//! The `FrameHeader` is a fixed 48-byte structure serialized as raw binary
//! (big-endian). Routing needs only these bytes, never the payload.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    Opcode,
    errors::{ProtocolError, Result},
};

/// Fixed 48-byte frame header (big-endian network byte order)
///
/// Fields are raw byte arrays so the layout has no padding and every
/// 48-byte pattern is a valid value.
///
/// # Security
///
/// `#[repr(C, packed)]` with zerocopy traits makes casting untrusted network
/// bytes sound. Structural checks (magic, version, size limit) happen in
/// [`FrameHeader::from_bytes`]. The header is authenticated end to end only
/// for sealed opcodes, where thread, sender and recipient are bound into the
/// AEAD associated data.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    // Protocol identification (8 bytes: 0-7)
    magic: [u8; 4],             // 0x4C4B5931 ("LKY1")
    version: u8,                // 0x01
    flags: u8,                  // reserved, zero
    pub(crate) opcode: [u8; 2], // u16 operation code

    // Payload metadata (8 bytes: 8-15)
    pub(crate) payload_size: [u8; 4], // u32 payload length
    fanout_id: [u8; 4],               // u32 shared by every copy of one message

    // Routing context (32 bytes: 16-47)
    thread_id: [u8; 16],   // u128, 0 = main thread
    sender_id: [u8; 8],    // u64 participant id
    recipient_id: [u8; 8], // u64 participant id, 0 = broadcast
}

impl FrameHeader {
    /// Size of the serialized header
    pub const SIZE: usize = 48;

    /// Magic number: "LKY1" in ASCII
    pub const MAGIC: u32 = 0x4C4B_5931;

    /// Current protocol version
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size (1 MiB)
    pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

    /// Recipient value addressing every participant (or the relay itself)
    pub const BROADCAST: u64 = 0;

    /// Create a new header with the specified opcode and zeroed routing.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self {
            magic: Self::MAGIC.to_be_bytes(),
            version: Self::VERSION,
            flags: 0,
            opcode: opcode.to_u16().to_be_bytes(),
            payload_size: [0; 4],
            fanout_id: [0; 4],
            thread_id: [0; 16],
            sender_id: [0; 8],
            recipient_id: [0; 8],
        }
    }

    /// Create a header with routing fields set.
    #[must_use]
    pub fn routed(opcode: Opcode, thread_id: u128, sender_id: u64, recipient_id: u64) -> Self {
        let mut header = Self::new(opcode);
        header.set_thread_id(thread_id);
        header.set_sender_id(sender_id);
        header.set_recipient_id(recipient_id);
        header
    }

    /// Parse header from network bytes (zero-copy, safe)
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if buffer is shorter than 48 bytes
    /// - `ProtocolError::InvalidMagic` if magic number is invalid
    /// - `ProtocolError::UnsupportedVersion` if protocol version is unsupported
    /// - `ProtocolError::PayloadTooLarge` if payload size exceeds maximum
    ///
    /// Checks run cheapest first so garbage fails fast. The opcode is NOT
    /// validated here; see [`FrameHeader::opcode_enum`].
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if u32::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize header to bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// Protocol magic number.
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_be_bytes(self.magic)
    }

    /// Protocol version byte.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Reserved flag byte.
    #[must_use]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Operation code as raw u16.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes(self.opcode)
    }

    /// Operation code as enum. `None` if unrecognized.
    #[must_use]
    pub fn opcode_enum(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode())
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }

    /// Fan-out id.
    ///
    /// A sender seals one copy of a message per recipient; all copies carry
    /// the same non-zero id so the relay can count the message once. Zero
    /// means untagged.
    #[must_use]
    pub fn fanout_id(&self) -> u32 {
        u32::from_be_bytes(self.fanout_id)
    }

    /// Destination thread.
    #[must_use]
    pub fn thread_id(&self) -> u128 {
        u128::from_be_bytes(self.thread_id)
    }

    /// Originating participant.
    #[must_use]
    pub fn sender_id(&self) -> u64 {
        u64::from_be_bytes(self.sender_id)
    }

    /// Addressed participant ([`Self::BROADCAST`] for everyone).
    #[must_use]
    pub fn recipient_id(&self) -> u64 {
        u64::from_be_bytes(self.recipient_id)
    }

    /// Routing context bound into AEAD associated data:
    /// `thread_id || sender_id || recipient_id`.
    #[must_use]
    pub fn routing_context(&self) -> [u8; 32] {
        let mut context = [0u8; 32];
        context[..16].copy_from_slice(&self.thread_id);
        context[16..24].copy_from_slice(&self.sender_id);
        context[24..].copy_from_slice(&self.recipient_id);
        context
    }

    /// Update destination thread.
    pub fn set_thread_id(&mut self, thread_id: u128) {
        self.thread_id = thread_id.to_be_bytes();
    }

    /// Update originating participant.
    pub fn set_sender_id(&mut self, sender_id: u64) {
        self.sender_id = sender_id.to_be_bytes();
    }

    /// Update addressed participant.
    pub fn set_recipient_id(&mut self, recipient_id: u64) {
        self.recipient_id = recipient_id.to_be_bytes();
    }

    /// Tag this copy with its message's fan-out id.
    pub fn set_fanout_id(&mut self, fanout_id: u32) {
        self.fanout_id = fanout_id.to_be_bytes();
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("magic", &format!("{:#010x}", self.magic()))
            .field("version", &self.version())
            .field("opcode", &format!("{:#06x}", self.opcode()))
            .field("payload_size", &self.payload_size())
            .field("fanout_id", &self.fanout_id())
            .field("thread_id", &format!("{:#034x}", self.thread_id()))
            .field("sender_id", &self.sender_id())
            .field("recipient_id", &self.recipient_id())
            .finish_non_exhaustive()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn valid_prefix() -> [u8; FrameHeader::SIZE] {
        let mut buf = [0u8; FrameHeader::SIZE];
        buf[0..4].copy_from_slice(&FrameHeader::MAGIC.to_be_bytes());
        buf[4] = FrameHeader::VERSION;
        buf
    }

    #[test]
    fn header_size() {
        assert_eq!(std::mem::size_of::<FrameHeader>(), FrameHeader::SIZE);
    }

    #[test]
    fn field_offsets() {
        let header = FrameHeader::routed(Opcode::Message, 0x0102, 0x0A0B, 0x0C0D);
        let bytes = header.to_bytes();

        assert_eq!(&bytes[0..4], b"LKY1");
        assert_eq!(&bytes[6..8], &[0x00, 0x10]);
        assert_eq!(&bytes[30..32], &[0x01, 0x02]);
        assert_eq!(&bytes[38..40], &[0x0A, 0x0B]);
        assert_eq!(&bytes[46..48], &[0x0C, 0x0D]);
    }

    #[test]
    fn routing_context_covers_thread_sender_recipient() {
        let header = FrameHeader::routed(Opcode::Image, 7, 8, 9);
        assert_eq!(&header.routing_context()[..], &header.to_bytes()[16..48]);
    }

    #[test]
    fn reject_short_buffer() {
        let result = FrameHeader::from_bytes(&[0u8; 20]);
        assert_eq!(result, Err(ProtocolError::FrameTooShort { expected: 48, actual: 20 }));
    }

    #[test]
    fn reject_invalid_magic() {
        let mut buf = valid_prefix();
        buf[0..4].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(FrameHeader::from_bytes(&buf), Err(ProtocolError::InvalidMagic));
    }

    #[test]
    fn reject_invalid_version() {
        let mut buf = valid_prefix();
        buf[4] = 0x7F;
        assert_eq!(FrameHeader::from_bytes(&buf), Err(ProtocolError::UnsupportedVersion(0x7F)));
    }

    #[test]
    fn reject_oversized_payload() {
        let mut buf = valid_prefix();
        let oversized = FrameHeader::MAX_PAYLOAD_SIZE + 1;
        buf[8..12].copy_from_slice(&oversized.to_be_bytes());

        assert!(matches!(
            FrameHeader::from_bytes(&buf),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    proptest! {
        #[test]
        fn header_round_trip(
            thread in any::<u128>(),
            sender in any::<u64>(),
            recipient in any::<u64>(),
            fanout in any::<u32>(),
        ) {
            let mut header = FrameHeader::routed(Opcode::Message, thread, sender, recipient);
            header.set_fanout_id(fanout);

            let bytes = header.to_bytes();
            let parsed = FrameHeader::from_bytes(&bytes).unwrap();

            prop_assert_eq!(&header, parsed);
            prop_assert_eq!(parsed.thread_id(), thread);
            prop_assert_eq!(parsed.sender_id(), sender);
            prop_assert_eq!(parsed.recipient_id(), recipient);
            prop_assert_eq!(parsed.fanout_id(), fanout);
            prop_assert_eq!(parsed.flags(), 0);
        }
    }
}
