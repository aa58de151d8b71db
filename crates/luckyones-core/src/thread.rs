//! Thread model.
//!
//! The kind is a closed tagged variant and every kind-specific rule
//! (lifetime, who may join later) dispatches on it explicitly.

use std::{
    collections::{BTreeSet, VecDeque},
    time::Duration,
};

pub use luckyones_proto::DeleteReason;
use luckyones_proto::WireThreadKind;

use crate::{
    config::CoreConfig,
    identity::{AttachmentId, ParticipantId, ThreadId},
};

/// Thread kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadKind {
    /// Network-wide, never expires, everyone is a member
    Main,
    /// Expires; every current and later participant is a member
    Public,
    /// Expires; membership fixed at creation (may only shrink on leave)
    Private,
}

impl ThreadKind {
    /// Lifetime for a thread of this kind. `None` means it never expires.
    pub fn ttl(self, config: &CoreConfig) -> Option<Duration> {
        match self {
            Self::Main => None,
            Self::Public | Self::Private => Some(config.thread_ttl),
        }
    }

    /// True if participants who join the network later become members.
    pub fn admits_later_joiners(self) -> bool {
        match self {
            Self::Main | Self::Public => true,
            Self::Private => false,
        }
    }
}

impl From<WireThreadKind> for ThreadKind {
    fn from(kind: WireThreadKind) -> Self {
        match kind {
            WireThreadKind::Main => Self::Main,
            WireThreadKind::Public => Self::Public,
            WireThreadKind::Private => Self::Private,
        }
    }
}

impl From<ThreadKind> for WireThreadKind {
    fn from(kind: ThreadKind) -> Self {
        match kind {
            ThreadKind::Main => Self::Main,
            ThreadKind::Public => Self::Public,
            ThreadKind::Private => Self::Private,
        }
    }
}

/// Outcome of a thread policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Message recorded
    Accepted,
    /// Sender is not a member
    RejectedNotMember,
    /// Thread is past its deadline or gone
    RejectedExpired,
}

impl Admission {
    /// True for [`Admission::Accepted`].
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

/// What the registry needs to know about a message to admit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Originating participant
    pub sender: ParticipantId,
    /// Attachment carried by an IMAGE, if any
    pub attachment: Option<AttachmentId>,
}

impl MessageEnvelope {
    /// Envelope for a text message.
    pub fn text(sender: ParticipantId) -> Self {
        Self { sender, attachment: None }
    }

    /// Envelope for an image.
    pub fn image(sender: ParticipantId, attachment: AttachmentId) -> Self {
        Self { sender, attachment: Some(attachment) }
    }
}

/// Transient reference to an admitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MessageRef<I> {
    pub(crate) sender: ParticipantId,
    pub(crate) admitted_at: I,
}

#[derive(Debug)]
pub(crate) struct Thread<I> {
    pub(crate) id: ThreadId,
    pub(crate) kind: ThreadKind,
    pub(crate) name: String,
    pub(crate) creator: ParticipantId,
    pub(crate) members: BTreeSet<ParticipantId>,
    pub(crate) created_at: I,
    pub(crate) deadline: Option<I>,
    pub(crate) messages: VecDeque<MessageRef<I>>,
    pub(crate) attachments: BTreeSet<AttachmentId>,
    pub(crate) closed: bool,
}

impl<I: Copy + Ord> Thread<I> {
    /// True once `now` has reached the deadline.
    pub(crate) fn is_expired(&self, now: I) -> bool {
        self.closed || self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub(crate) fn snapshot(&self) -> ThreadSnapshot<I> {
        ThreadSnapshot {
            id: self.id,
            kind: self.kind,
            name: self.name.clone(),
            creator: self.creator,
            members: self.members.iter().copied().collect(),
            created_at: self.created_at,
            deadline: self.deadline,
            message_count: self.messages.len(),
            attachment_count: self.attachments.len(),
            last_activity: self.messages.back().map(|m| m.admitted_at),
            last_sender: self.messages.back().map(|m| m.sender),
        }
    }
}

/// Read-only view of a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot<I> {
    /// Thread id
    pub id: ThreadId,
    /// Kind
    pub kind: ThreadKind,
    /// Display name
    pub name: String,
    /// Creating participant
    pub creator: ParticipantId,
    /// Current members, ascending
    pub members: Vec<ParticipantId>,
    /// Creation time
    pub created_at: I,
    /// Deletion time; `None` for the main thread
    pub deadline: Option<I>,
    /// Message references currently held
    pub message_count: usize,
    /// Attachments currently tracked
    pub attachment_count: usize,
    /// Admission time of the newest held message
    pub last_activity: Option<I>,
    /// Sender of the newest held message
    pub last_sender: Option<ParticipantId>,
}

impl<I> ThreadSnapshot<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Time left before deletion, saturating at zero. `None` for main.
    pub fn remaining(&self, now: I) -> Option<Duration> {
        self.deadline.map(|deadline| if deadline > now { deadline - now } else { Duration::ZERO })
    }

    /// True if `participant` is a member.
    pub fn has_member(&self, participant: ParticipantId) -> bool {
        self.members.binary_search(&participant).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_main_is_unbounded() {
        let config = CoreConfig::default();
        assert_eq!(ThreadKind::Main.ttl(&config), None);
        assert_eq!(ThreadKind::Public.ttl(&config), Some(CoreConfig::DEFAULT_THREAD_TTL));
        assert_eq!(ThreadKind::Private.ttl(&config), Some(CoreConfig::DEFAULT_THREAD_TTL));
    }

    #[test]
    fn private_threads_do_not_grow() {
        assert!(ThreadKind::Main.admits_later_joiners());
        assert!(ThreadKind::Public.admits_later_joiners());
        assert!(!ThreadKind::Private.admits_later_joiners());
    }

    #[test]
    fn wire_kind_round_trips() {
        for kind in [ThreadKind::Main, ThreadKind::Public, ThreadKind::Private] {
            assert_eq!(ThreadKind::from(WireThreadKind::from(kind)), kind);
        }
    }

    #[test]
    fn deadline_is_inclusive() {
        let thread = Thread {
            id: ThreadId(1),
            kind: ThreadKind::Public,
            name: String::new(),
            creator: ParticipantId(1),
            members: BTreeSet::new(),
            created_at: 0u64,
            deadline: Some(10u64),
            messages: VecDeque::new(),
            attachments: BTreeSet::new(),
            closed: false,
        };
        assert!(!thread.is_expired(9));
        assert!(thread.is_expired(10));
    }
}
