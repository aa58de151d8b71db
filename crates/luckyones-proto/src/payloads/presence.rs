//! Participant presence payloads.

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Longest accepted display name, in bytes
pub const MAX_USERNAME_LEN: usize = 64;

/// Participant announcement
///
/// Carries the long-term X25519 public key peers use to establish sessions.
/// The header's `sender_id` must be the id derived from this key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    /// Long-term X25519 public key
    pub public_key: [u8; 32],
    /// Display name (opaque to the protocol)
    pub username: String,
    /// Thread being joined; absent means the network (and the main thread)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<u128>,
}

impl Join {
    pub(crate) fn validate(&self) -> Result<()> {
        validate_username(&self.username)
    }
}

/// Participant departure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leave {
    /// Optional human-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One connected participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    /// Participant id
    pub id: u64,
    /// Long-term X25519 public key
    pub public_key: [u8; 32],
    /// Display name
    pub username: String,
}

/// Snapshot of connected participants, sent to a joiner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserList {
    /// Everyone currently connected, excluding the recipient
    pub participants: Vec<ParticipantInfo>,
}

impl UserList {
    pub(crate) fn validate(&self) -> Result<()> {
        self.participants.iter().try_for_each(|p| validate_username(&p.username))
    }
}

fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(ProtocolError::InvalidField { field: "username", reason: "empty" });
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(ProtocolError::InvalidField { field: "username", reason: "too long" });
    }
    Ok(())
}
