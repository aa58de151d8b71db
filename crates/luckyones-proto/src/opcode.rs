//! Operation codes identifying the payload kind of each frame

/// Frame operation code (u16, big-endian on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Participant announces itself (and its public key)
    Join = 0x0001,
    /// Participant departs
    Leave = 0x0002,
    /// Snapshot of connected participants
    UserList = 0x0003,

    /// Encrypted text message
    Message = 0x0010,
    /// Encrypted image attachment
    Image = 0x0011,

    /// Thread announcement
    CreateThread = 0x0020,
    /// Thread removal (expired or explicit)
    DeleteThread = 0x0021,
    /// Snapshot of threads visible to a participant
    ThreadList = 0x0022,

    /// Error response
    Error = 0x00FF,
}

impl Opcode {
    /// Raw wire value.
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a wire value. `None` if not part of the protocol.
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Join),
            0x0002 => Some(Self::Leave),
            0x0003 => Some(Self::UserList),
            0x0010 => Some(Self::Message),
            0x0011 => Some(Self::Image),
            0x0020 => Some(Self::CreateThread),
            0x0021 => Some(Self::DeleteThread),
            0x0022 => Some(Self::ThreadList),
            0x00FF => Some(Self::Error),
            _ => None,
        }
    }

    /// True for opcodes whose payload is end-to-end encrypted.
    ///
    /// Relays route these by header alone.
    pub const fn is_sealed(self) -> bool {
        matches!(self, Self::Message | Self::Image)
    }
}
