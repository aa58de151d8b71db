//! Relay driver.
//!
//! Server-side instance of the core. Tracks who is connected, which threads
//! exist and who belongs to them, and forwards sealed frames between
//! members. It never holds key material and never decrypts.
//!
//! Sans-IO: the runtime feeds [`RelayEvent`]s and executes the returned
//! [`RelayAction`]s. All methods take `&self`; the connection table, each
//! thread and the deadline queue are locked independently and never across
//! I/O.
//!
//! A sealed message arrives once per recipient. Copies sharing a sender,
//! thread and non-zero fan-out id are admitted into the thread history once.

use std::collections::HashMap;

use luckyones_core::{
    Admission, AttachmentId, CoreConfig, CoreError, DeleteReason, Environment, ExpiryScheduler,
    ExpiryTarget, MessageEnvelope, ParticipantId, ThreadId, ThreadKind, ThreadRegistry,
    ThreadSnapshot,
};
use luckyones_crypto::PublicKey;
use luckyones_proto::{
    CreateThread, DeleteThread, ErrorPayload, Frame, FrameHeader, Join, Leave, Opcode,
    ParticipantInfo, Payload, ThreadList, ThreadSummary, UserList,
};
use parking_lot::{Mutex, RwLock};

use crate::{
    registry::{ConnectionRegistry, Presence},
    server_error::RelayError,
};

/// Relay configuration
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Thread and attachment lifetimes
    pub core: CoreConfig,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { core: CoreConfig::default(), max_connections: 10_000 }
    }
}

/// Events the relay driver processes.
///
/// Produced by the runtime (production or simulation).
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A new connection was accepted
    ConnectionAccepted {
        /// Unique connection id assigned by the runtime
        connection_id: u64,
    },

    /// A frame was received from a connection
    FrameReceived {
        /// Connection that sent the frame
        connection_id: u64,
        /// The received frame
        frame: Frame,
    },

    /// A connection was closed (by peer or error)
    ConnectionClosed {
        /// Connection that was closed
        connection_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Periodic tick for deadline processing
    Tick,
}

/// Actions the relay driver produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    /// Send a frame to one connection
    SendToConnection {
        /// Target connection
        connection_id: u64,
        /// Frame to send
        frame: Frame,
    },

    /// Close a connection
    CloseConnection {
        /// Connection to close
        connection_id: u64,
        /// Reason for closure
        reason: String,
    },
}

/// Action-based relay.
pub struct RelayDriver<E: Environment> {
    env: E,
    config: RelayConfig,
    connections: RwLock<ConnectionRegistry>,
    threads: ThreadRegistry<E::Instant>,
    scheduler: ExpiryScheduler<E::Instant>,
    /// Last admitted `(thread, fan-out id)` per sender
    fanouts: Mutex<HashMap<ParticipantId, (ThreadId, u32)>>,
}

impl<E: Environment> RelayDriver<E> {
    /// Create a relay with only the main thread.
    pub fn new(env: E, config: RelayConfig) -> Self {
        let now = env.now();
        Self {
            threads: ThreadRegistry::new(config.core, now),
            scheduler: ExpiryScheduler::new(),
            connections: RwLock::new(ConnectionRegistry::new()),
            fanouts: Mutex::new(HashMap::new()),
            env,
            config,
        }
    }

    /// Thread table.
    pub fn threads(&self) -> &ThreadRegistry<E::Instant> {
        &self.threads
    }

    /// Deadline queue.
    pub fn scheduler(&self) -> &ExpiryScheduler<E::Instant> {
        &self.scheduler
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Participant currently bound to a connection.
    pub fn participant(&self, connection_id: u64) -> Option<ParticipantId> {
        self.connections.read().participant(connection_id)
    }

    /// Process an event and return actions to execute.
    pub fn process_event(&self, event: RelayEvent) -> Result<Vec<RelayAction>, RelayError> {
        match event {
            RelayEvent::ConnectionAccepted { connection_id } => self.handle_accepted(connection_id),
            RelayEvent::FrameReceived { connection_id, frame } => {
                self.handle_frame(connection_id, &frame)
            },
            RelayEvent::ConnectionClosed { connection_id, reason } => {
                self.handle_closed(connection_id, &reason)
            },
            RelayEvent::Tick => self.handle_tick(),
        }
    }

    fn handle_accepted(&self, connection_id: u64) -> Result<Vec<RelayAction>, RelayError> {
        let mut connections = self.connections.write();
        if connections.len() >= self.config.max_connections {
            tracing::warn!(connection_id, "max connections exceeded");
            return Ok(vec![RelayAction::CloseConnection {
                connection_id,
                reason: "max connections exceeded".to_string(),
            }]);
        }
        if !connections.register(connection_id) {
            return Err(RelayError::ConnectionExists(connection_id));
        }
        tracing::debug!(connection_id, "connection accepted");
        Ok(Vec::new())
    }

    fn handle_closed(
        &self,
        connection_id: u64,
        reason: &str,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let presence = {
            let mut connections = self.connections.write();
            if !connections.has_connection(connection_id) {
                return Err(RelayError::ConnectionNotFound(connection_id));
            }
            connections.unregister(connection_id)
        };
        tracing::debug!(connection_id, reason, "connection closed");

        match presence {
            Some(presence) => self.depart(presence.participant, None),
            None => Ok(Vec::new()),
        }
    }

    fn handle_frame(
        &self,
        connection_id: u64,
        frame: &Frame,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let participant = {
            let connections = self.connections.read();
            if !connections.has_connection(connection_id) {
                return Err(RelayError::ConnectionNotFound(connection_id));
            }
            connections.participant(connection_id)
        };
        let thread = ThreadId(frame.header.thread_id());

        let payload = match Payload::from_frame(frame) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::debug!(connection_id, error = %err, "rejecting malformed frame");
                let payload = ErrorPayload::invalid_payload(err.to_string());
                return self.error(connection_id, thread, payload);
            },
        };

        if let Payload::Join(join) = payload {
            return self.handle_join(connection_id, frame, join);
        }

        // Everything else requires a joined connection whose header names
        // itself as sender
        let Some(sender) = participant else {
            return self.error(connection_id, thread, ErrorPayload::forbidden("join first"));
        };
        if frame.header.sender_id() != sender.0 {
            return self.error(connection_id, thread, ErrorPayload::forbidden("sender mismatch"));
        }

        match payload {
            Payload::Leave(leave) => self.handle_leave(connection_id, sender, &leave),
            Payload::Message(_) => {
                self.forward(connection_id, sender, frame, MessageEnvelope::text(sender))
            },
            Payload::Image(image) => {
                let envelope = MessageEnvelope::image(sender, AttachmentId(image.attachment_id));
                self.forward(connection_id, sender, frame, envelope)
            },
            Payload::CreateThread(create) => self.handle_create(connection_id, sender, create),
            Payload::DeleteThread(delete) => self.handle_delete(connection_id, sender, delete),
            Payload::Join(_)
            | Payload::UserList(_)
            | Payload::ThreadList(_)
            | Payload::Error(_) => {
                let payload = ErrorPayload::invalid_payload("opcode is relay-to-client only");
                self.error(connection_id, thread, payload)
            },
        }
    }

    fn handle_join(
        &self,
        connection_id: u64,
        frame: &Frame,
        join: Join,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let public_key = PublicKey::from_bytes(join.public_key);
        let participant = ParticipantId::from_public_key(&public_key);
        if frame.header.sender_id() != participant.0 {
            return self.error(
                connection_id,
                ThreadId::MAIN,
                ErrorPayload::forbidden("sender id does not match public key"),
            );
        }
        if let Err(err) = public_key.validate() {
            tracing::debug!(connection_id, error = %err, "join refused");
            let payload = ErrorPayload::invalid_payload(err.to_string());
            return self.error(connection_id, ThreadId::MAIN, payload);
        }
        let thread = join.thread_id.map(ThreadId);

        // A repeated JOIN from the bound participant only asks for a thread
        let current = self.connections.read().participant(connection_id);
        if let (Some(thread), true) = (thread, current == Some(participant)) {
            return self.join_thread(connection_id, participant, thread);
        }

        let presence = Presence { participant, public_key, username: join.username };
        let (others, bound) = {
            let mut connections = self.connections.write();
            let bound = connections.bind(connection_id, presence);
            (connections.joined(), bound)
        };
        if let Err(err) = bound {
            tracing::debug!(connection_id, error = %err, "join refused");
            let payload = ErrorPayload::forbidden(err.to_string());
            return self.error(connection_id, ThreadId::MAIN, payload);
        }

        self.threads.join(participant);
        tracing::info!(connection_id, participant = %participant, "participant joined");

        let now = self.env.now();
        let refused = match thread {
            Some(thread) => match self.threads.join_thread(thread, participant, now) {
                Admission::Accepted => None,
                admission => Some(self.rejected(connection_id, thread, admission)?),
            },
            None => None,
        };
        let user_list = UserList {
            participants: self
                .connections
                .read()
                .presences()
                .into_iter()
                .filter(|presence| presence.participant != participant)
                .map(|presence| ParticipantInfo {
                    id: presence.participant.0,
                    public_key: presence.public_key.to_bytes(),
                    username: presence.username,
                })
                .collect(),
        };
        let thread_list = ThreadList {
            threads: self
                .threads
                .threads_for(participant)
                .iter()
                .map(|snapshot| summary(snapshot, now))
                .collect(),
        };

        let reply = FrameHeader::routed(Opcode::UserList, 0, 0, participant.0);
        let mut actions = vec![
            RelayAction::SendToConnection {
                connection_id,
                frame: Payload::UserList(user_list).into_frame(reply)?,
            },
            RelayAction::SendToConnection {
                connection_id,
                frame: Payload::ThreadList(thread_list).into_frame(reply)?,
            },
        ];

        actions.extend(refused.into_iter().flatten());

        for (other, conn) in others {
            if other != participant {
                let frame = frame.clone();
                actions.push(RelayAction::SendToConnection { connection_id: conn, frame });
            }
        }
        Ok(actions)
    }

    /// Enter one thread on an already joined connection.
    fn join_thread(
        &self,
        connection_id: u64,
        participant: ParticipantId,
        thread: ThreadId,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let now = self.env.now();
        let admission = self.threads.join_thread(thread, participant, now);
        let snapshot = self.threads.snapshot(thread);
        let (Admission::Accepted, Some(snapshot)) = (admission, snapshot) else {
            tracing::debug!(connection_id, thread = %thread, ?admission, "thread join refused");
            return self.rejected(connection_id, thread, admission);
        };
        tracing::debug!(connection_id, participant = %participant, thread = %thread, "joined");

        let list = ThreadList { threads: vec![summary(&snapshot, now)] };
        let header = FrameHeader::routed(Opcode::ThreadList, thread.0, 0, participant.0);
        let frame = Payload::ThreadList(list).into_frame(header)?;
        Ok(vec![RelayAction::SendToConnection { connection_id, frame }])
    }

    fn handle_leave(
        &self,
        connection_id: u64,
        sender: ParticipantId,
        leave: &Leave,
    ) -> Result<Vec<RelayAction>, RelayError> {
        self.connections.write().unbind(connection_id);
        tracing::info!(connection_id, participant = %sender, reason = ?leave.reason, "left");
        self.depart(sender, leave.reason.clone())
    }

    /// Remove a departed participant everywhere and tell the others.
    fn depart(
        &self,
        participant: ParticipantId,
        reason: Option<String>,
    ) -> Result<Vec<RelayAction>, RelayError> {
        self.threads.leave(participant);
        self.fanouts.lock().remove(&participant);

        let header = FrameHeader::routed(Opcode::Leave, 0, participant.0, FrameHeader::BROADCAST);
        let frame = Payload::Leave(Leave { reason }).into_frame(header)?;
        let joined = self.connections.read().joined();
        Ok(joined
            .into_iter()
            .map(|(_, connection_id)| RelayAction::SendToConnection {
                connection_id,
                frame: frame.clone(),
            })
            .collect())
    }

    /// Admit a sealed frame and forward it to its recipient.
    fn forward(
        &self,
        connection_id: u64,
        sender: ParticipantId,
        frame: &Frame,
        envelope: MessageEnvelope,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let now = self.env.now();
        let thread = ThreadId(frame.header.thread_id());
        let recipient = ParticipantId(frame.header.recipient_id());

        let target = self.connections.read().connection_for(recipient);
        let Some(target) = target.filter(|_| self.threads.is_member(thread, recipient)) else {
            // Policy errors take precedence over an unknown recipient
            let admission = self.threads.authorize(thread, sender, now);
            if !admission.is_accepted() {
                return self.rejected(connection_id, thread, admission);
            }
            return self.error(connection_id, thread, ErrorPayload::unknown_recipient(recipient.0));
        };

        let admission = if self.first_copy(sender, thread, frame.header.fanout_id()) {
            let (admission, tracked) = self.threads.admit_and_track(thread, envelope, now);
            if let (true, Some(attachment)) = (admission.is_accepted(), tracked) {
                let deadline = now + self.config.core.attachment_ttl;
                self.scheduler.schedule(deadline, ExpiryTarget::Attachment(attachment));
            }
            admission
        } else {
            self.threads.authorize(thread, sender, now)
        };
        if !admission.is_accepted() {
            return self.rejected(connection_id, thread, admission);
        }

        Ok(vec![RelayAction::SendToConnection { connection_id: target, frame: frame.clone() }])
    }

    /// True unless the previous copy from `sender` carried the same
    /// non-zero fan-out id in the same thread.
    fn first_copy(&self, sender: ParticipantId, thread: ThreadId, fanout: u32) -> bool {
        if fanout == 0 {
            return true;
        }
        let previous = self.fanouts.lock().insert(sender, (thread, fanout));
        previous != Some((thread, fanout))
    }

    fn handle_create(
        &self,
        connection_id: u64,
        sender: ParticipantId,
        create: CreateThread,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let id = ThreadId(create.thread_id);
        if create.creator != sender.0 {
            return self.error(connection_id, id, ErrorPayload::forbidden("creator must be sender"));
        }

        let kind = ThreadKind::from(create.kind);
        let members: Vec<_> = create.members.iter().copied().map(ParticipantId).collect();
        let snapshot =
            match self.threads.create(id, kind, create.name, sender, &members, self.env.now()) {
                Ok(snapshot) => snapshot,
                Err(CoreError::ThreadExists(_)) => {
                    return self.error(connection_id, id, ErrorPayload::thread_exists(id.0));
                },
                Err(err) => {
                    return self.error(connection_id, id, ErrorPayload::forbidden(err.to_string()));
                },
            };
        if let Some(deadline) = snapshot.deadline {
            self.scheduler.schedule(deadline, ExpiryTarget::Thread(id));
        }

        let announce = CreateThread {
            thread_id: id.0,
            kind: kind.into(),
            name: snapshot.name.clone(),
            creator: sender.0,
            members: snapshot.members.iter().map(|member| member.0).collect(),
        };
        let header =
            FrameHeader::routed(Opcode::CreateThread, id.0, sender.0, FrameHeader::BROADCAST);
        let frame = Payload::CreateThread(announce).into_frame(header)?;

        let others: Vec<_> =
            snapshot.members.into_iter().filter(|member| *member != sender).collect();
        Ok(self.send_to_members(&others, &frame))
    }

    fn handle_delete(
        &self,
        connection_id: u64,
        sender: ParticipantId,
        delete: DeleteThread,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let id = ThreadId(delete.thread_id);
        if id.is_main() {
            let payload = ErrorPayload::forbidden("main thread cannot be deleted");
            return self.error(connection_id, id, payload);
        }
        let Some(snapshot) = self.threads.snapshot(id) else {
            return self.error(connection_id, id, ErrorPayload::expired(id.0));
        };
        if snapshot.creator != sender {
            return self.error(
                connection_id,
                id,
                ErrorPayload::forbidden("only the creator may delete a thread"),
            );
        }

        let mut actions = Vec::new();
        self.close_thread(id, DeleteReason::Explicit, Some(sender), &mut actions)?;
        Ok(actions)
    }

    fn handle_tick(&self) -> Result<Vec<RelayAction>, RelayError> {
        let mut due = Vec::new();
        self.scheduler.tick(self.env.now(), |fired| due.push(fired.target));

        let mut actions = Vec::new();
        for target in due {
            match target {
                ExpiryTarget::Thread(id) => {
                    self.close_thread(id, DeleteReason::Expired, None, &mut actions)?;
                },
                ExpiryTarget::Attachment(attachment) => {
                    if let Some(thread) = self.threads.release_attachment(attachment) {
                        tracing::debug!(%attachment, %thread, "attachment expired");
                    }
                },
            }
        }
        Ok(actions)
    }

    /// Close a thread and announce it to former members, except `skip`.
    fn close_thread(
        &self,
        id: ThreadId,
        reason: DeleteReason,
        skip: Option<ParticipantId>,
        actions: &mut Vec<RelayAction>,
    ) -> Result<(), RelayError> {
        let Some(closed) = self.threads.close(id, reason) else {
            return Ok(());
        };

        let header = FrameHeader::routed(
            Opcode::DeleteThread,
            id.0,
            ParticipantId::SYSTEM.0,
            FrameHeader::BROADCAST,
        );
        let delete = DeleteThread { thread_id: id.0, reason };
        let frame = Payload::DeleteThread(delete).into_frame(header)?;

        let notify: Vec<_> =
            closed.former_members.into_iter().filter(|member| Some(*member) != skip).collect();
        actions.extend(self.send_to_members(&notify, &frame));
        Ok(())
    }

    fn send_to_members(&self, members: &[ParticipantId], frame: &Frame) -> Vec<RelayAction> {
        let connections = self.connections.read();
        members
            .iter()
            .filter_map(|member| connections.connection_for(*member))
            .map(|connection_id| RelayAction::SendToConnection {
                connection_id,
                frame: frame.clone(),
            })
            .collect()
    }

    fn rejected(
        &self,
        connection_id: u64,
        thread: ThreadId,
        admission: Admission,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let payload = match admission {
            Admission::RejectedNotMember => ErrorPayload::not_member(thread.0),
            Admission::RejectedExpired | Admission::Accepted => ErrorPayload::expired(thread.0),
        };
        self.error(connection_id, thread, payload)
    }

    fn error(
        &self,
        connection_id: u64,
        thread: ThreadId,
        payload: ErrorPayload,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let recipient = self.connections.read().participant(connection_id).map_or(0, |p| p.0);
        tracing::debug!(connection_id, code = payload.code, message = %payload.message, "error");
        let header = FrameHeader::routed(Opcode::Error, thread.0, 0, recipient);
        let frame = Payload::Error(payload).into_frame(header)?;
        Ok(vec![RelayAction::SendToConnection { connection_id, frame }])
    }
}

fn summary<I>(snapshot: &ThreadSnapshot<I>, now: I) -> ThreadSummary
where
    I: Copy + Ord + std::ops::Sub<Output = std::time::Duration>,
{
    ThreadSummary {
        thread_id: snapshot.id.0,
        kind: snapshot.kind.into(),
        name: snapshot.name.clone(),
        creator: snapshot.creator.0,
        members: snapshot.members.iter().map(|member| member.0).collect(),
        // Rounded up so a thread about to close is not advertised as 0 s
        remaining_secs: snapshot
            .remaining(now)
            .map(|remaining| remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)),
    }
}
