//! Message router.
//!
//! Sans-IO façade for one local participant. Inbound frames and local
//! commands go in, [`RouterAction`]s come out; the caller owns the
//! transport and the UI.
//!
//! # Inbound MESSAGE / IMAGE
//!
//! ```text
//! frame ─> policy check ─> decrypt ─> admit ─> Deliver
//!             │              │          │
//!             └─ Rejected    │          └─ Rejected (expired meanwhile)
//!                            ├─ Undecryptable (auth, deferred, bad key)
//!                            └─ dropped (duplicate)
//! ```
//!
//! Group content fans out: one sealed frame per remote member, each under
//! the pairwise session for that thread.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use bytes::Bytes;
use luckyones_crypto::{KeyPair, PublicKey, RatchetHeader};
use luckyones_proto::{
    CreateThread, DeleteThread, EncryptedImage, EncryptedMessage, ErrorPayload, Frame,
    FrameHeader, Join, Leave, Opcode, ParticipantInfo, Payload, ThreadList, UserList,
    WireRatchetHeader,
};
use parking_lot::RwLock;

use crate::{
    attachment::AttachmentStore,
    config::CoreConfig,
    engine::RatchetEngine,
    env::Environment,
    error::CoreError,
    expiry::{ExpiryScheduler, ExpiryTarget, Fired},
    identity::{AttachmentId, ParticipantId, ThreadId},
    thread::{Admission, DeleteReason, MessageEnvelope, ThreadKind, ThreadSnapshot},
    thread_registry::{NewThread, ThreadRegistry},
};

/// Decrypted content handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveredContent {
    /// Text message
    Text(String),
    /// Image bytes; also held by the attachment store until purged
    Image {
        /// Attachment id
        attachment: AttachmentId,
        /// Decrypted bytes
        bytes: Bytes,
    },
}

/// A message that authenticated and was admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    /// Thread it was posted to
    pub thread: ThreadId,
    /// Sender
    pub sender: ParticipantId,
    /// Content
    pub content: DeliveredContent,
}

/// Transient, non-fatal conditions the application may surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A message could not be decrypted; nothing was advanced
    Undecryptable {
        /// Thread
        thread: ThreadId,
        /// Claimed sender
        sender: ParticipantId,
    },
    /// Thread policy refused a message
    Rejected {
        /// Thread
        thread: ThreadId,
        /// Sender
        sender: ParticipantId,
        /// Why
        admission: Admission,
    },
    /// The relay refused one of our frames
    Relay {
        /// Error code (see [`ErrorPayload`])
        code: u16,
        /// Human-readable reason
        message: String,
    },
}

/// Actions for the caller to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterAction<I> {
    /// Transmit this frame
    Send(Frame),
    /// Show this message
    Deliver(DeliveredMessage),
    /// Surface this notice
    Notice(Notice),
    /// A thread became visible
    ThreadOpened(ThreadSnapshot<I>),
    /// A thread was deleted along with its sessions and attachments
    ThreadClosed {
        /// Thread
        thread: ThreadId,
        /// Why
        reason: DeleteReason,
    },
    /// An attachment's bytes were purged
    AttachmentPurged(AttachmentId),
}

/// Router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Messages delivered
    pub delivered: u64,
    /// Messages that failed to decrypt
    pub undecryptable: u64,
    /// Replays dropped
    pub duplicates: u64,
    /// Messages refused by thread policy
    pub rejected: u64,
    /// Skipped message keys evicted from live sessions
    pub evictions: u64,
}

#[derive(Debug, Clone)]
struct Peer {
    public_key: PublicKey,
    username: String,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    undecryptable: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
}

/// Client-side messaging façade.
///
/// All methods take `&self`; share it behind `Arc`.
pub struct MessageRouter<E: Environment, A: AttachmentStore> {
    env: E,
    engine: RatchetEngine,
    registry: ThreadRegistry<E::Instant>,
    scheduler: ExpiryScheduler<E::Instant>,
    store: A,
    username: String,
    directory: RwLock<HashMap<ParticipantId, Peer>>,
    counters: Counters,
    next_fanout: AtomicU32,
}

impl<E: Environment, A: AttachmentStore> MessageRouter<E, A> {
    /// Create a router for `identity`.
    pub fn new(
        env: E,
        identity: KeyPair,
        username: impl Into<String>,
        config: CoreConfig,
        store: A,
    ) -> Self {
        let now = env.now();
        Self {
            engine: RatchetEngine::new(identity, config.session_limits),
            registry: ThreadRegistry::new(config, now),
            scheduler: ExpiryScheduler::new(),
            env,
            store,
            username: username.into(),
            directory: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            next_fanout: AtomicU32::new(1),
        }
    }

    /// Local participant id.
    pub fn participant_id(&self) -> ParticipantId {
        self.engine.participant_id()
    }

    /// Local long-term public key.
    pub fn public_key(&self) -> PublicKey {
        self.engine.public_key()
    }

    /// Session table.
    pub fn engine(&self) -> &RatchetEngine {
        &self.engine
    }

    /// Thread table.
    pub fn registry(&self) -> &ThreadRegistry<E::Instant> {
        &self.registry
    }

    /// Deadline queue.
    pub fn scheduler(&self) -> &ExpiryScheduler<E::Instant> {
        &self.scheduler
    }

    /// Attachment store.
    pub fn store(&self) -> &A {
        &self.store
    }

    /// Known peers and their display names, ordered by id.
    pub fn peers(&self) -> Vec<(ParticipantId, String)> {
        let mut peers: Vec<_> = self
            .directory
            .read()
            .iter()
            .map(|(id, peer)| (*id, peer.username.clone()))
            .collect();
        peers.sort_unstable();
        peers
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            undecryptable: self.counters.undecryptable.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            evictions: self.engine.evicted_keys(),
        }
    }

    /// Announce ourselves to the network.
    pub fn join_network(&self) -> Result<Vec<RouterAction<E::Instant>>, CoreError> {
        self.join_network_in(None)
    }

    /// Announce ourselves, optionally asking to enter `thread` as well.
    ///
    /// Also valid after the first JOIN: the relay then only checks the
    /// thread and answers with its THREAD_LIST entry or an ERROR.
    pub fn join_network_in(
        &self,
        thread: Option<ThreadId>,
    ) -> Result<Vec<RouterAction<E::Instant>>, CoreError> {
        self.registry.join(self.participant_id());

        let join = Join {
            public_key: self.public_key().to_bytes(),
            username: self.username.clone(),
            thread_id: thread.map(|thread| thread.0),
        };
        let routed = thread.unwrap_or(ThreadId::MAIN);
        let frame = Payload::Join(join).into_frame(self.header(Opcode::Join, routed))?;
        tracing::info!(participant = %self.participant_id(), ?thread, "joining network");
        Ok(vec![RouterAction::Send(frame)])
    }

    /// Leave the network, dropping every session and thread membership.
    pub fn leave_network(&self) -> Result<Vec<RouterAction<E::Instant>>, CoreError> {
        let frame = Payload::Leave(Leave::default())
            .into_frame(self.header(Opcode::Leave, ThreadId::MAIN))?;

        self.engine.clear();
        self.directory.write().clear();
        for peer in self.registry.participants() {
            self.registry.leave(peer);
        }
        tracing::info!(participant = %self.participant_id(), "left network");
        Ok(vec![RouterAction::Send(frame)])
    }

    /// Encrypt `text` for every other member of `thread`.
    ///
    /// A member whose session cannot be established is skipped with a
    /// warning; the others still receive the message.
    ///
    /// # Errors
    ///
    /// - `Rejected` if we may not post to `thread`
    pub fn send_text(
        &self,
        thread: ThreadId,
        text: &str,
    ) -> Result<Vec<RouterAction<E::Instant>>, CoreError> {
        let now = self.env.now();
        let recipients = self.recipients(thread, now)?;
        let fanout = self.next_fanout();

        let mut actions = Vec::with_capacity(recipients.len());
        for (peer, key) in recipients {
            let header = self.addressed(Opcode::Message, thread, peer, fanout);
            let Some((ratchet, ciphertext)) =
                self.seal(thread, peer, &key, &header, None, text.as_bytes())
            else {
                continue;
            };
            let payload =
                Payload::Message(EncryptedMessage { header: to_wire(&ratchet), ciphertext });
            actions.push(RouterAction::Send(payload.into_frame(header)?));
        }

        self.registry.admit(thread, MessageEnvelope::text(self.participant_id()), now);
        Ok(actions)
    }

    /// Encrypt an image for every other member of `thread`.
    ///
    /// The bytes are kept in the local store and purged after the
    /// attachment lifetime, or earlier if the thread closes.
    pub fn send_image(
        &self,
        thread: ThreadId,
        bytes: Bytes,
    ) -> Result<(AttachmentId, Vec<RouterAction<E::Instant>>), CoreError> {
        let now = self.env.now();
        let recipients = self.recipients(thread, now)?;
        let attachment = AttachmentId(self.env.random_u128());
        let fanout = self.next_fanout();

        let mut actions = Vec::with_capacity(recipients.len());
        for (peer, key) in recipients {
            let header = self.addressed(Opcode::Image, thread, peer, fanout);
            let Some((ratchet, ciphertext)) =
                self.seal(thread, peer, &key, &header, Some(attachment), &bytes)
            else {
                continue;
            };
            let payload = Payload::Image(EncryptedImage {
                header: to_wire(&ratchet),
                attachment_id: attachment.0,
                ciphertext,
            });
            actions.push(RouterAction::Send(payload.into_frame(header)?));
        }

        self.retain_attachment(thread, self.participant_id(), attachment, bytes, now);
        Ok((attachment, actions))
    }

    /// Create a thread and announce it.
    ///
    /// `members` is only used for private threads.
    pub fn create_thread(
        &self,
        kind: ThreadKind,
        name: &str,
        members: &[ParticipantId],
    ) -> Result<(ThreadId, Vec<RouterAction<E::Instant>>), CoreError> {
        let now = self.env.now();
        let id = ThreadId(self.env.random_u128());
        let invited: Vec<_> = match kind {
            ThreadKind::Private => members.to_vec(),
            ThreadKind::Main | ThreadKind::Public => Vec::new(),
        };

        let snapshot =
            self.registry.create(id, kind, name, self.participant_id(), &invited, now)?;
        self.schedule_thread(&snapshot);

        let announce = CreateThread {
            thread_id: id.0,
            kind: kind.into(),
            name: name.to_string(),
            creator: self.participant_id().0,
            members: snapshot.members.iter().map(|member| member.0).collect(),
        };
        let frame =
            Payload::CreateThread(announce).into_frame(self.header(Opcode::CreateThread, id))?;

        Ok((id, vec![RouterAction::Send(frame), RouterAction::ThreadOpened(snapshot)]))
    }

    /// Delete a thread we created.
    ///
    /// Deleting a thread that is already gone succeeds with no actions.
    ///
    /// # Errors
    ///
    /// - `Forbidden` for main or threads created by someone else
    pub fn delete_thread(
        &self,
        thread: ThreadId,
    ) -> Result<Vec<RouterAction<E::Instant>>, CoreError> {
        if thread.is_main() {
            return Err(CoreError::Forbidden("main thread cannot be deleted"));
        }
        let Some(snapshot) = self.registry.snapshot(thread) else {
            return Ok(Vec::new());
        };
        if snapshot.creator != self.participant_id() {
            return Err(CoreError::Forbidden("only the creator may delete a thread"));
        }

        let delete = DeleteThread { thread_id: thread.0, reason: DeleteReason::Explicit };
        let frame =
            Payload::DeleteThread(delete).into_frame(self.header(Opcode::DeleteThread, thread))?;

        let mut actions = vec![RouterAction::Send(frame)];
        self.close_thread(thread, DeleteReason::Explicit, &mut actions);
        Ok(actions)
    }

    /// Fire every due deadline.
    pub fn tick(&self) -> Vec<RouterAction<E::Instant>> {
        let mut actions = Vec::new();
        self.scheduler.tick(self.env.now(), |fired: Fired<E::Instant>| match fired.target {
            ExpiryTarget::Thread(thread) => {
                self.close_thread(thread, DeleteReason::Expired, &mut actions);
            },
            ExpiryTarget::Attachment(attachment) => {
                if self.registry.release_attachment(attachment).is_some() {
                    self.purge(attachment, &mut actions);
                }
            },
        });
        actions
    }

    /// Process one inbound frame.
    ///
    /// # Errors
    ///
    /// - `Protocol` if the frame does not decode; no state changes
    pub fn handle_frame(
        &self,
        frame: &Frame,
    ) -> Result<Vec<RouterAction<E::Instant>>, CoreError> {
        let payload = Payload::from_frame(frame)?;
        let sender = ParticipantId(frame.header.sender_id());
        let thread = ThreadId(frame.header.thread_id());

        let actions = match payload {
            Payload::Join(join) => {
                self.learn_peer(sender, PublicKey::from_bytes(join.public_key), join.username);
                Vec::new()
            },
            Payload::UserList(list) => {
                self.learn_peers(list);
                Vec::new()
            },
            Payload::Leave(_) => {
                self.forget_peer(sender);
                Vec::new()
            },
            Payload::Message(message) => self.receive_message(&frame.header, &message),
            Payload::Image(image) => self.receive_image(&frame.header, &image),
            Payload::CreateThread(create) => self.receive_create(create),
            Payload::ThreadList(list) => self.receive_thread_list(list),
            Payload::DeleteThread(delete) => self.receive_delete(sender, delete),
            Payload::Error(ErrorPayload { code, message }) => {
                tracing::warn!(code, %message, thread = %thread, "relay rejected frame");
                vec![RouterAction::Notice(Notice::Relay { code, message })]
            },
        };
        Ok(actions)
    }

    fn header(&self, opcode: Opcode, thread: ThreadId) -> FrameHeader {
        FrameHeader::routed(opcode, thread.0, self.participant_id().0, FrameHeader::BROADCAST)
    }

    fn addressed(
        &self,
        opcode: Opcode,
        thread: ThreadId,
        peer: ParticipantId,
        fanout: u32,
    ) -> FrameHeader {
        let mut header = FrameHeader::routed(opcode, thread.0, self.participant_id().0, peer.0);
        header.set_fanout_id(fanout);
        header
    }

    /// Next non-zero fan-out id.
    fn next_fanout(&self) -> u32 {
        loop {
            let id = self.next_fanout.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Other members of `thread` with a known key.
    fn recipients(
        &self,
        thread: ThreadId,
        now: E::Instant,
    ) -> Result<Vec<(ParticipantId, PublicKey)>, CoreError> {
        let local = self.participant_id();
        let admission = self.registry.authorize(thread, local, now);
        if !admission.is_accepted() {
            return Err(CoreError::Rejected { thread, admission });
        }
        let Some(snapshot) = self.registry.snapshot(thread) else {
            return Err(CoreError::Rejected { thread, admission: Admission::RejectedExpired });
        };

        let directory = self.directory.read();
        let recipients = snapshot
            .members
            .into_iter()
            .filter(|member| *member != local)
            .filter_map(|member| match directory.get(&member) {
                Some(peer) => Some((member, peer.public_key)),
                None => {
                    tracing::debug!(thread = %thread, member = %member, "member key unknown");
                    None
                },
            })
            .collect();
        Ok(recipients)
    }

    /// Seal one copy for `peer`. `None` if that session is unusable; the
    /// failure is logged and no other session is touched.
    fn seal(
        &self,
        thread: ThreadId,
        peer: ParticipantId,
        key: &PublicKey,
        header: &FrameHeader,
        attachment: Option<AttachmentId>,
        plaintext: &[u8],
    ) -> Option<(RatchetHeader, Vec<u8>)> {
        let context = sealing_context(header, attachment);
        let sealed = self
            .engine
            .ensure_session(thread, peer, key, self.env.random_key())
            .and_then(|_| self.engine.encrypt(thread, peer, &context, plaintext));
        match sealed {
            Ok(sealed) => Some(sealed),
            Err(err) => {
                tracing::warn!(thread = %thread, peer = %peer, error = %err, "skipping recipient");
                None
            },
        }
    }

    /// Policy check then decrypt. `None` means the message was dropped and
    /// any notice has been pushed.
    fn open(
        &self,
        header: &FrameHeader,
        ratchet: &WireRatchetHeader,
        attachment: Option<AttachmentId>,
        ciphertext: &[u8],
        actions: &mut Vec<RouterAction<E::Instant>>,
    ) -> Option<Vec<u8>> {
        let thread = ThreadId(header.thread_id());
        let sender = ParticipantId(header.sender_id());

        if header.recipient_id() != self.participant_id().0 {
            tracing::warn!(thread = %thread, sender = %sender, "frame addressed to someone else");
            return None;
        }

        let admission = self.registry.authorize(thread, sender, self.env.now());
        if !admission.is_accepted() {
            self.reject(thread, sender, admission, actions);
            return None;
        }

        let context = sealing_context(header, attachment);
        let result = self.sender_key(sender).and_then(|key| {
            self.engine.ensure_session(thread, sender, &key, self.env.random_key())?;
            let ratchet = from_wire(ratchet);
            let fresh = || self.env.random_key();
            self.engine.decrypt(thread, sender, &ratchet, &context, ciphertext, fresh)
        });

        match result {
            Ok(plaintext) => Some(plaintext),
            Err(err) if err.is_silent() => {
                tracing::debug!(thread = %thread, sender = %sender, error = %err, "dropped");
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                None
            },
            Err(err) => {
                if err.is_transient() {
                    tracing::debug!(thread = %thread, sender = %sender, error = %err, "not yet");
                } else {
                    tracing::warn!(thread = %thread, sender = %sender, error = %err, "rejected");
                }
                self.undecryptable(thread, sender, actions);
                None
            },
        }
    }

    fn sender_key(&self, sender: ParticipantId) -> Result<PublicKey, CoreError> {
        self.directory
            .read()
            .get(&sender)
            .map(|peer| peer.public_key)
            .ok_or(CoreError::UnknownParticipant(sender))
    }

    fn receive_message(
        &self,
        header: &FrameHeader,
        message: &EncryptedMessage,
    ) -> Vec<RouterAction<E::Instant>> {
        let mut actions = Vec::new();
        let Some(plaintext) =
            self.open(header, &message.header, None, &message.ciphertext, &mut actions)
        else {
            return actions;
        };

        let thread = ThreadId(header.thread_id());
        let sender = ParticipantId(header.sender_id());
        let admission = self.registry.admit(thread, MessageEnvelope::text(sender), self.env.now());
        if !admission.is_accepted() {
            self.reject(thread, sender, admission, &mut actions);
            return actions;
        }

        let text = String::from_utf8_lossy(&plaintext).into_owned();
        self.deliver(thread, sender, DeliveredContent::Text(text), &mut actions);
        actions
    }

    fn receive_image(
        &self,
        header: &FrameHeader,
        image: &EncryptedImage,
    ) -> Vec<RouterAction<E::Instant>> {
        let mut actions = Vec::new();
        let attachment = AttachmentId(image.attachment_id);
        let Some(plaintext) =
            self.open(header, &image.header, Some(attachment), &image.ciphertext, &mut actions)
        else {
            return actions;
        };

        let thread = ThreadId(header.thread_id());
        let sender = ParticipantId(header.sender_id());
        let bytes = Bytes::from(plaintext);
        let admission =
            self.retain_attachment(thread, sender, attachment, bytes.clone(), self.env.now());
        if !admission.is_accepted() {
            self.reject(thread, sender, admission, &mut actions);
            return actions;
        }

        self.deliver(thread, sender, DeliveredContent::Image { attachment, bytes }, &mut actions);
        actions
    }

    /// Admit an image, store its bytes and schedule its purge.
    fn retain_attachment(
        &self,
        thread: ThreadId,
        sender: ParticipantId,
        attachment: AttachmentId,
        bytes: Bytes,
        now: E::Instant,
    ) -> Admission {
        let envelope = MessageEnvelope::image(sender, attachment);
        let (admission, tracked) = self.registry.admit_and_track(thread, envelope, now);
        if !admission.is_accepted() {
            return admission;
        }
        if let Err(err) = self.store.store(attachment, bytes) {
            tracing::warn!(attachment = %attachment, error = %err, "failed to store attachment");
        }
        if tracked.is_some() {
            let ttl = self.registry.config().attachment_ttl;
            self.scheduler.schedule(now + ttl, ExpiryTarget::Attachment(attachment));
        }
        admission
    }

    fn receive_create(&self, create: CreateThread) -> Vec<RouterAction<E::Instant>> {
        let id = ThreadId(create.thread_id);
        let kind = ThreadKind::from(create.kind);
        let creator = ParticipantId(create.creator);
        let members: Vec<_> = create.members.into_iter().map(ParticipantId).collect();

        match self.registry.create(id, kind, create.name, creator, &members, self.env.now()) {
            Ok(snapshot) => {
                self.schedule_thread(&snapshot);
                vec![RouterAction::ThreadOpened(snapshot)]
            },
            Err(err) => {
                tracing::debug!(thread = %id, error = %err, "ignoring thread announcement");
                Vec::new()
            },
        }
    }

    fn receive_thread_list(&self, list: ThreadList) -> Vec<RouterAction<E::Instant>> {
        let now = self.env.now();
        let mut actions = Vec::new();

        for summary in list.threads {
            let kind = ThreadKind::from(summary.kind);
            let Some(remaining) = summary.remaining_secs else {
                continue;
            };
            let spec = NewThread {
                id: ThreadId(summary.thread_id),
                kind,
                name: summary.name,
                creator: ParticipantId(summary.creator),
                members: summary.members.into_iter().map(ParticipantId).collect(),
            };
            let id = spec.id;
            match self.registry.adopt(spec, now, std::time::Duration::from_secs(remaining)) {
                Ok(snapshot) => {
                    self.schedule_thread(&snapshot);
                    actions.push(RouterAction::ThreadOpened(snapshot));
                },
                Err(err) => tracing::debug!(thread = %id, error = %err, "skipping listed thread"),
            }
        }
        actions
    }

    fn receive_delete(
        &self,
        sender: ParticipantId,
        delete: DeleteThread,
    ) -> Vec<RouterAction<E::Instant>> {
        let thread = ThreadId(delete.thread_id);
        let authorized = sender == ParticipantId::SYSTEM
            || self.registry.snapshot(thread).is_some_and(|snapshot| snapshot.creator == sender);
        if !authorized {
            tracing::warn!(thread = %thread, sender = %sender, "unauthorized thread deletion");
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.close_thread(thread, delete.reason, &mut actions);
        actions
    }

    fn learn_peers(&self, list: UserList) {
        for ParticipantInfo { id, public_key, username } in list.participants {
            self.learn_peer(ParticipantId(id), PublicKey::from_bytes(public_key), username);
        }
    }

    fn learn_peer(&self, claimed: ParticipantId, public_key: PublicKey, username: String) {
        if ParticipantId::from_public_key(&public_key) != claimed {
            tracing::warn!(participant = %claimed, "participant id does not match its key");
            return;
        }
        if let Err(err) = public_key.validate() {
            tracing::warn!(participant = %claimed, error = %err, "ignoring unusable key");
            return;
        }
        if claimed == self.participant_id() {
            return;
        }

        self.directory.write().insert(claimed, Peer { public_key, username });
        let joined = self.registry.join(claimed);
        tracing::debug!(participant = %claimed, threads = joined.len(), "peer joined");
    }

    fn forget_peer(&self, peer: ParticipantId) {
        if self.directory.write().remove(&peer).is_none() {
            return;
        }
        let left = self.registry.leave(peer);
        let evicted = self.engine.evict_peer(peer);
        tracing::debug!(participant = %peer, threads = left.len(), evicted, "peer left");
    }

    fn schedule_thread(&self, snapshot: &ThreadSnapshot<E::Instant>) {
        if let Some(deadline) = snapshot.deadline {
            self.scheduler.schedule(deadline, ExpiryTarget::Thread(snapshot.id));
        }
    }

    fn close_thread(
        &self,
        thread: ThreadId,
        reason: DeleteReason,
        actions: &mut Vec<RouterAction<E::Instant>>,
    ) {
        let Some(closed) = self.registry.close(thread, reason) else {
            return;
        };
        self.engine.evict_thread(thread);
        for attachment in closed.attachments {
            self.purge(attachment, actions);
        }
        actions.push(RouterAction::ThreadClosed { thread, reason });
    }

    fn purge(&self, attachment: AttachmentId, actions: &mut Vec<RouterAction<E::Instant>>) {
        match self.store.purge(attachment) {
            Ok(_) => tracing::debug!(attachment = %attachment, "attachment purged"),
            Err(err) => {
                tracing::warn!(attachment = %attachment, error = %err, "attachment purge failed");
            },
        }
        actions.push(RouterAction::AttachmentPurged(attachment));
    }

    fn deliver(
        &self,
        thread: ThreadId,
        sender: ParticipantId,
        content: DeliveredContent,
        actions: &mut Vec<RouterAction<E::Instant>>,
    ) {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        actions.push(RouterAction::Deliver(DeliveredMessage { thread, sender, content }));
    }

    fn reject(
        &self,
        thread: ThreadId,
        sender: ParticipantId,
        admission: Admission,
        actions: &mut Vec<RouterAction<E::Instant>>,
    ) {
        tracing::debug!(thread = %thread, sender = %sender, ?admission, "message rejected");
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        actions.push(RouterAction::Notice(Notice::Rejected { thread, sender, admission }));
    }

    fn undecryptable(
        &self,
        thread: ThreadId,
        sender: ParticipantId,
        actions: &mut Vec<RouterAction<E::Instant>>,
    ) {
        self.counters.undecryptable.fetch_add(1, Ordering::Relaxed);
        actions.push(RouterAction::Notice(Notice::Undecryptable { thread, sender }));
    }
}

impl<E: Environment, A: AttachmentStore> std::fmt::Debug for MessageRouter<E, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("participant", &self.participant_id())
            .field("threads", &self.registry.len())
            .field("sessions", &self.engine.session_count())
            .finish_non_exhaustive()
    }
}

/// Associated data bound into every sealed frame: opcode, thread, sender,
/// recipient and (for images) the attachment id.
fn sealing_context(header: &FrameHeader, attachment: Option<AttachmentId>) -> Vec<u8> {
    let mut context = Vec::with_capacity(2 + 32 + 16);
    context.extend_from_slice(&header.opcode().to_be_bytes());
    context.extend_from_slice(&header.routing_context());
    if let Some(attachment) = attachment {
        context.extend_from_slice(&attachment.0.to_be_bytes());
    }
    context
}

fn to_wire(header: &RatchetHeader) -> WireRatchetHeader {
    WireRatchetHeader {
        ratchet_key: header.ratchet_key.to_bytes(),
        previous_chain_length: header.previous_chain_length,
        counter: header.counter,
    }
}

fn from_wire(header: &WireRatchetHeader) -> RatchetHeader {
    RatchetHeader {
        ratchet_key: PublicKey::from_bytes(header.ratchet_key),
        previous_chain_length: header.previous_chain_length,
        counter: header.counter,
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::attachment::MemoryAttachmentStore;

    /// Frozen clock, counter-driven bytes.
    #[derive(Clone, Default)]
    struct FixedEnv {
        next: Arc<AtomicU64>,
    }

    impl Environment for FixedEnv {
        type Instant = Duration;

        fn now(&self) -> Duration {
            Duration::ZERO
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            for byte in buffer {
                *byte = self.next.fetch_add(1, Ordering::Relaxed).to_le_bytes()[0];
            }
        }
    }

    fn router(env: &FixedEnv) -> MessageRouter<FixedEnv, MemoryAttachmentStore> {
        let identity = KeyPair::from_secret_bytes(env.random_key());
        let store = MemoryAttachmentStore::new();
        MessageRouter::new(env.clone(), identity, "peer", CoreConfig::default(), store)
    }

    fn sent(actions: Vec<RouterAction<Duration>>) -> Vec<Frame> {
        actions
            .into_iter()
            .filter_map(|action| match action {
                RouterAction::Send(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fanout_survives_a_member_without_a_session() {
        let env = FixedEnv::default();
        let alice = router(&env);
        let bob = router(&env);
        alice.join_network().unwrap();
        bob.join_network().unwrap();
        alice.learn_peer(bob.participant_id(), bob.public_key(), "bob".to_string());
        bob.learn_peer(alice.participant_id(), alice.public_key(), "alice".to_string());

        // Entered behind learn_peer's back so the session itself fails
        let zero = PublicKey::from_bytes([0; 32]);
        let mallory = ParticipantId::from_public_key(&zero);
        let peer = Peer { public_key: zero, username: "mallory".to_string() };
        alice.directory.write().insert(mallory, peer);
        alice.registry.join(mallory);

        for round in 0..2 {
            let frames = sent(alice.send_text(ThreadId::MAIN, "hi").unwrap());
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].header.recipient_id(), bob.participant_id().0);
            assert_ne!(frames[0].header.fanout_id(), 0);

            let delivered = bob.handle_frame(&frames[0]).unwrap();
            assert!(matches!(delivered.as_slice(), [RouterAction::Deliver(_)]), "round {round}");
        }
        assert_eq!(bob.stats().delivered, 2);
        assert_eq!(bob.stats().undecryptable, 0);
        assert_eq!(alice.engine.session_count(), 1);
    }

    #[test]
    fn unmapped_sender_is_unknown_and_reported() {
        let env = FixedEnv::default();
        let alice = router(&env);
        let bob = router(&env);
        alice.join_network().unwrap();
        bob.join_network().unwrap();
        alice.learn_peer(bob.participant_id(), bob.public_key(), "bob".to_string());

        let err = bob.sender_key(alice.participant_id()).unwrap_err();
        assert_eq!(err, CoreError::UnknownParticipant(alice.participant_id()));
        assert!(err.is_transient());

        // Bob never learned Alice, so her message cannot be opened yet
        bob.registry.join(alice.participant_id());
        let frames = sent(alice.send_text(ThreadId::MAIN, "early").unwrap());
        let actions = bob.handle_frame(&frames[0]).unwrap();
        assert!(matches!(
            actions.as_slice(),
            [RouterAction::Notice(Notice::Undecryptable { .. })]
        ));
        assert_eq!(bob.stats().undecryptable, 1);
        assert_eq!(bob.stats().duplicates, 0);
    }

    #[test]
    fn copies_of_one_message_share_a_fanout_id() {
        let env = FixedEnv::default();
        let alice = router(&env);
        let bob = router(&env);
        let carol = router(&env);
        alice.join_network().unwrap();
        for other in [&bob, &carol] {
            alice.learn_peer(other.participant_id(), other.public_key(), "other".to_string());
        }

        let first = sent(alice.send_text(ThreadId::MAIN, "one").unwrap());
        let second = sent(alice.send_text(ThreadId::MAIN, "two").unwrap());
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].header.fanout_id(), first[1].header.fanout_id());
        assert_ne!(first[0].header.fanout_id(), second[0].header.fanout_id());
    }

    #[test]
    fn context_binds_routing_and_attachment() {
        let header = FrameHeader::routed(Opcode::Image, 7, 1, 2);
        let plain = sealing_context(&header, None);
        let with_attachment = sealing_context(&header, Some(AttachmentId(5)));

        assert_eq!(plain.len(), 34);
        assert_eq!(with_attachment.len(), 50);
        assert_eq!(&with_attachment[..34], plain.as_slice());

        let other_recipient = FrameHeader::routed(Opcode::Image, 7, 1, 3);
        assert_ne!(sealing_context(&other_recipient, None), plain);
    }

    #[test]
    fn wire_header_conversion_preserves_fields() {
        let header = RatchetHeader {
            ratchet_key: PublicKey::from_bytes([4; 32]),
            previous_chain_length: 3,
            counter: 9,
        };
        assert_eq!(from_wire(&to_wire(&header)), header);
    }
}
