//! Thread lifecycle payloads.

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Longest accepted thread name, in bytes
pub const MAX_THREAD_NAME_LEN: usize = 128;

/// Most members a thread announcement may list
pub const MAX_MEMBERS: usize = 1024;

/// Thread kind as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireThreadKind {
    /// Network-wide thread, never expires
    Main,
    /// Open to every participant, expires
    Public,
    /// Fixed membership, expires
    Private,
}

/// Thread announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateThread {
    /// New thread id (chosen by the creator)
    pub thread_id: u128,
    /// Kind
    pub kind: WireThreadKind,
    /// Display name
    pub name: String,
    /// Creating participant
    pub creator: u64,
    /// Initial members; for public threads this is informational
    pub members: Vec<u64>,
}

impl CreateThread {
    pub(crate) fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_members(&self.members)
    }
}

/// Why a thread was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteReason {
    /// Deadline reached
    Expired,
    /// Creator deleted it
    Explicit,
}

/// Thread removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteThread {
    /// Removed thread
    pub thread_id: u128,
    /// Why
    pub reason: DeleteReason,
}

/// One thread in a [`ThreadList`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    /// Thread id
    pub thread_id: u128,
    /// Kind
    pub kind: WireThreadKind,
    /// Display name
    pub name: String,
    /// Creating participant
    pub creator: u64,
    /// Current members
    pub members: Vec<u64>,
    /// Seconds until deletion; `None` for the main thread
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<u64>,
}

/// Threads visible to the recipient
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadList {
    /// Visible threads
    pub threads: Vec<ThreadSummary>,
}

impl ThreadList {
    pub(crate) fn validate(&self) -> Result<()> {
        self.threads.iter().try_for_each(|t| {
            validate_name(&t.name)?;
            validate_members(&t.members)
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.len() > MAX_THREAD_NAME_LEN {
        return Err(ProtocolError::InvalidField { field: "name", reason: "too long" });
    }
    Ok(())
}

fn validate_members(members: &[u64]) -> Result<()> {
    if members.len() > MAX_MEMBERS {
        return Err(ProtocolError::InvalidField { field: "members", reason: "too many" });
    }
    Ok(())
}
