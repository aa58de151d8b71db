//! Thread registry.
//!
//! Owns every live thread, the set of connected participants and the
//! attachment index. Threads are individually locked; the map lock is only
//! held long enough to find or insert an `Arc`.
//!
//! Lock order: a thread lock may be held while taking the attachment index
//! lock, never the reverse. The participant set and the thread map are never
//! held while another thread's lock is taken.

use std::{
    collections::{BTreeSet, HashMap, VecDeque, hash_map::Entry},
    ops::Add,
    sync::Arc,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};

use crate::{
    config::CoreConfig,
    error::CoreError,
    identity::{AttachmentId, ParticipantId, ThreadId},
    thread::{
        Admission, DeleteReason, MessageEnvelope, MessageRef, Thread, ThreadKind, ThreadSnapshot,
    },
};

/// Everything that must follow a thread's closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedThread {
    /// Closed thread
    pub id: ThreadId,
    /// Its kind
    pub kind: ThreadKind,
    /// Why it closed
    pub reason: DeleteReason,
    /// Members at the time of closing, ascending
    pub former_members: Vec<ParticipantId>,
    /// Attachments to purge; each id is reported by exactly one closure or
    /// release
    pub attachments: Vec<AttachmentId>,
}

/// Description of a thread to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewThread {
    /// Thread id
    pub id: ThreadId,
    /// Kind; never [`ThreadKind::Main`]
    pub kind: ThreadKind,
    /// Display name
    pub name: String,
    /// Creating participant, always a member
    pub creator: ParticipantId,
    /// Initial members besides the creator
    pub members: Vec<ParticipantId>,
}

/// Registry of live threads.
///
/// Generic over `I` (Instant type) to support virtual time in tests.
pub struct ThreadRegistry<I> {
    config: CoreConfig,
    threads: RwLock<HashMap<ThreadId, Arc<Mutex<Thread<I>>>>>,
    participants: RwLock<BTreeSet<ParticipantId>>,
    attachments: Mutex<HashMap<AttachmentId, ThreadId>>,
}

impl<I> ThreadRegistry<I>
where
    I: Copy + Ord + Add<Duration, Output = I>,
{
    /// Create a registry holding only the main thread.
    pub fn new(config: CoreConfig, now: I) -> Self {
        let main = Thread {
            id: ThreadId::MAIN,
            kind: ThreadKind::Main,
            name: "main".to_string(),
            creator: ParticipantId::SYSTEM,
            members: BTreeSet::new(),
            created_at: now,
            deadline: None,
            messages: VecDeque::new(),
            attachments: BTreeSet::new(),
            closed: false,
        };

        let mut threads = HashMap::new();
        threads.insert(ThreadId::MAIN, Arc::new(Mutex::new(main)));

        Self {
            config,
            threads: RwLock::new(threads),
            participants: RwLock::new(BTreeSet::new()),
            attachments: Mutex::new(HashMap::new()),
        }
    }

    /// Configuration the registry was built with.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Create a thread.
    ///
    /// Public threads start with every connected participant. Private
    /// threads start with exactly the creator plus `members`.
    ///
    /// # Errors
    ///
    /// - `Forbidden` for `ThreadKind::Main` (main exists implicitly)
    /// - `ThreadExists` if `id` is taken
    /// - `InvalidLifetime` if the configured lifetime is zero
    pub fn create(
        &self,
        id: ThreadId,
        kind: ThreadKind,
        name: impl Into<String>,
        creator: ParticipantId,
        members: &[ParticipantId],
        now: I,
    ) -> Result<ThreadSnapshot<I>, CoreError> {
        let Some(ttl) = kind.ttl(&self.config) else {
            return Err(CoreError::Forbidden("main thread cannot be created"));
        };
        if ttl.is_zero() {
            return Err(CoreError::InvalidLifetime);
        }
        let spec = NewThread { id, kind, name: name.into(), creator, members: members.to_vec() };
        self.insert(spec, now, ttl)
    }

    /// Register a thread learned from another party with `remaining`
    /// lifetime left, capped at the configured lifetime.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create); a zero `remaining` is
    /// `InvalidLifetime`.
    pub fn adopt(
        &self,
        thread: NewThread,
        now: I,
        remaining: Duration,
    ) -> Result<ThreadSnapshot<I>, CoreError> {
        let Some(ttl) = thread.kind.ttl(&self.config) else {
            return Err(CoreError::Forbidden("main thread cannot be created"));
        };
        let ttl = ttl.min(remaining);
        if ttl.is_zero() {
            return Err(CoreError::InvalidLifetime);
        }
        self.insert(thread, now, ttl)
    }

    fn insert(
        &self,
        spec: NewThread,
        now: I,
        ttl: Duration,
    ) -> Result<ThreadSnapshot<I>, CoreError> {
        let NewThread { id, kind, name, creator, members } = spec;
        let mut initial: BTreeSet<ParticipantId> = members.into_iter().collect();
        initial.insert(creator);

        let thread = Arc::new(Mutex::new(Thread {
            id,
            kind,
            name,
            creator,
            members: initial,
            created_at: now,
            deadline: Some(now + ttl),
            messages: VecDeque::new(),
            attachments: BTreeSet::new(),
            closed: false,
        }));

        {
            let mut threads = self.threads.write();
            if threads.contains_key(&id) {
                return Err(CoreError::ThreadExists(id));
            }
            threads.insert(id, Arc::clone(&thread));
        }

        // After insertion, so a concurrent join either lands here or finds
        // the thread in the map
        if kind.admits_later_joiners() {
            let everyone: Vec<_> = self.participants.read().iter().copied().collect();
            thread.lock().members.extend(everyone);
        }

        let snapshot = thread.lock().snapshot();
        tracing::info!(
            thread = %id,
            kind = ?kind,
            creator = %creator,
            members = snapshot.members.len(),
            "thread created"
        );
        Ok(snapshot)
    }

    /// Check whether `sender` may post to `id` at `now`, without recording.
    pub fn authorize(&self, id: ThreadId, sender: ParticipantId, now: I) -> Admission {
        let Some(thread) = self.get(id) else {
            return Admission::RejectedExpired;
        };
        let thread = thread.lock();
        Self::check(&thread, sender, now)
    }

    /// Admit a message: check policy, then record its reference.
    ///
    /// An IMAGE's attachment becomes tracked by the thread, so closing the
    /// thread purges it.
    pub fn admit(&self, id: ThreadId, envelope: MessageEnvelope, now: I) -> Admission {
        self.admit_and_track(id, envelope, now).0
    }

    /// Like [`admit`](Self::admit), also returning the attachment if this
    /// call started tracking it. Callers schedule the attachment's own
    /// deadline exactly when this is `Some`.
    pub fn admit_and_track(
        &self,
        id: ThreadId,
        envelope: MessageEnvelope,
        now: I,
    ) -> (Admission, Option<AttachmentId>) {
        let Some(thread) = self.get(id) else {
            tracing::debug!(thread = %id, sender = %envelope.sender, "admit: no such thread");
            return (Admission::RejectedExpired, None);
        };
        let mut thread = thread.lock();

        let admission = Self::check(&thread, envelope.sender, now);
        if admission != Admission::Accepted {
            tracing::debug!(thread = %id, sender = %envelope.sender, ?admission, "admit rejected");
            return (admission, None);
        }

        thread.messages.push_back(MessageRef { sender: envelope.sender, admitted_at: now });
        while thread.messages.len() > self.config.max_thread_messages {
            thread.messages.pop_front();
        }

        let mut tracked = None;
        if let Some(attachment) = envelope.attachment {
            thread.attachments.insert(attachment);
            if let Entry::Vacant(slot) = self.attachments.lock().entry(attachment) {
                slot.insert(id);
                tracked = Some(attachment);
            }
        }

        (Admission::Accepted, tracked)
    }

    /// Close a thread. Idempotent.
    ///
    /// Returns `None` if the thread is already gone (or is main, which never
    /// closes). Otherwise returns what the caller must clean up: sessions
    /// scoped to the thread and the listed attachments.
    pub fn close(&self, id: ThreadId, reason: DeleteReason) -> Option<ClosedThread> {
        if id.is_main() {
            tracing::warn!(?reason, "refusing to close main thread");
            return None;
        }

        let thread = self.threads.write().remove(&id)?;
        let mut thread = thread.lock();
        thread.closed = true;
        thread.messages.clear();

        let former_members: Vec<_> = std::mem::take(&mut thread.members).into_iter().collect();
        let tracked = std::mem::take(&mut thread.attachments);

        let attachments = {
            let mut index = self.attachments.lock();
            tracked.into_iter().filter(|attachment| index.remove(attachment).is_some()).collect()
        };

        tracing::info!(thread = %id, ?reason, members = former_members.len(), "thread closed");
        Some(ClosedThread { id, kind: thread.kind, reason, former_members, attachments })
    }

    /// Stop tracking an attachment (its own deadline fired).
    ///
    /// Returns the owning thread if the attachment was still tracked, in
    /// which case the caller purges it. A second call returns `None`.
    pub fn release_attachment(&self, attachment: AttachmentId) -> Option<ThreadId> {
        let owner = self.attachments.lock().remove(&attachment)?;
        if let Some(thread) = self.get(owner) {
            thread.lock().attachments.remove(&attachment);
        }
        Some(owner)
    }

    /// Register a connected participant.
    ///
    /// Adds it to main and every public thread. Returns those thread ids.
    pub fn join(&self, participant: ParticipantId) -> Vec<ThreadId> {
        self.participants.write().insert(participant);

        let mut joined = Vec::new();
        for thread in self.all() {
            let mut thread = thread.lock();
            if thread.kind.admits_later_joiners() && !thread.closed {
                thread.members.insert(participant);
                joined.push(thread.id);
            }
        }
        joined.sort_unstable();
        joined
    }

    /// Add `participant` to one thread.
    ///
    /// Succeeds for main and public threads, and for private threads the
    /// participant already belongs to.
    pub fn join_thread(&self, id: ThreadId, participant: ParticipantId, now: I) -> Admission {
        let Some(thread) = self.get(id) else {
            return Admission::RejectedExpired;
        };
        let mut thread = thread.lock();

        if thread.is_expired(now) {
            return Admission::RejectedExpired;
        }
        if thread.kind.admits_later_joiners() {
            thread.members.insert(participant);
            return Admission::Accepted;
        }
        if thread.members.contains(&participant) {
            Admission::Accepted
        } else {
            Admission::RejectedNotMember
        }
    }

    /// Deregister a participant and remove it from every thread.
    ///
    /// Returns the ids of threads it was a member of.
    pub fn leave(&self, participant: ParticipantId) -> Vec<ThreadId> {
        self.participants.write().remove(&participant);

        let mut left = Vec::new();
        for thread in self.all() {
            let mut thread = thread.lock();
            if thread.members.remove(&participant) {
                left.push(thread.id);
            }
        }
        left.sort_unstable();
        left
    }

    /// Read-only view of one thread.
    pub fn snapshot(&self, id: ThreadId) -> Option<ThreadSnapshot<I>> {
        self.get(id).map(|thread| thread.lock().snapshot())
    }

    /// Threads `participant` is a member of, ordered by id.
    pub fn threads_for(&self, participant: ParticipantId) -> Vec<ThreadSnapshot<I>> {
        let mut visible: Vec<_> = self
            .all()
            .into_iter()
            .filter_map(|thread| {
                let thread = thread.lock();
                thread.members.contains(&participant).then(|| thread.snapshot())
            })
            .collect();
        visible.sort_unstable_by_key(|snapshot| snapshot.id);
        visible
    }

    /// True if `participant` is a member of `id`.
    pub fn is_member(&self, id: ThreadId, participant: ParticipantId) -> bool {
        self.get(id).is_some_and(|thread| thread.lock().members.contains(&participant))
    }

    /// True if `id` has not been closed.
    pub fn contains(&self, id: ThreadId) -> bool {
        self.threads.read().contains_key(&id)
    }

    /// Number of live threads, including main.
    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    /// Always false: main is permanent.
    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }

    /// Connected participants, ascending.
    pub fn participants(&self) -> Vec<ParticipantId> {
        self.participants.read().iter().copied().collect()
    }

    /// Attachments currently tracked across all threads.
    pub fn tracked_attachments(&self) -> usize {
        self.attachments.lock().len()
    }

    fn check(thread: &Thread<I>, sender: ParticipantId, now: I) -> Admission {
        if thread.is_expired(now) {
            Admission::RejectedExpired
        } else if !thread.members.contains(&sender) {
            Admission::RejectedNotMember
        } else {
            Admission::Accepted
        }
    }

    fn get(&self, id: ThreadId) -> Option<Arc<Mutex<Thread<I>>>> {
        self.threads.read().get(&id).cloned()
    }

    fn all(&self) -> Vec<Arc<Mutex<Thread<I>>>> {
        self.threads.read().values().cloned().collect()
    }
}
