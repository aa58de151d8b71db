//! Session table.
//!
//! One [`RatchetSession`] per `(thread, remote participant)`, each behind its
//! own mutex. The table lock is held only to look up, insert or remove an
//! `Arc`; every ratchet step runs under the session lock alone, so steps on
//! different sessions proceed in parallel and steps on the same session
//! serialize.
//!
//! A missing entry is an uninitialized session. The first send or receive
//! with a known peer key establishes it.

use std::{collections::HashMap, sync::Arc};

use luckyones_crypto::{
    KeyPair, MessageKey, PublicKey, RatchetHeader, RatchetSession, SessionLimits,
};
use parking_lot::{Mutex, RwLock};

use crate::{
    error::CoreError,
    identity::{ParticipantId, ThreadId},
};

type SessionKey = (ThreadId, ParticipantId);

/// Owner of every ratchet session held by one local participant.
pub struct RatchetEngine {
    identity: KeyPair,
    participant: ParticipantId,
    limits: SessionLimits,
    sessions: RwLock<HashMap<SessionKey, Arc<Mutex<RatchetSession>>>>,
}

impl RatchetEngine {
    /// Create an engine for `identity` with no sessions.
    pub fn new(identity: KeyPair, limits: SessionLimits) -> Self {
        let participant = ParticipantId::from_public_key(&identity.public_key());
        Self { identity, participant, limits, sessions: RwLock::new(HashMap::new()) }
    }

    /// Long-term public key announced in JOIN.
    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    /// Local participant id.
    pub fn participant_id(&self) -> ParticipantId {
        self.participant
    }

    /// Establish the session with `peer` in `thread` if it does not exist.
    ///
    /// Returns true if a session was created. Key agreement runs outside
    /// the table lock; if another caller wins the race its session is kept.
    ///
    /// # Errors
    ///
    /// - `Crypto(InvalidKey)` if `remote` is low-order or our own key; no
    ///   session is created
    pub fn ensure_session(
        &self,
        thread: ThreadId,
        peer: ParticipantId,
        remote: &PublicKey,
        fresh_secret: [u8; 32],
    ) -> Result<bool, CoreError> {
        if self.sessions.read().contains_key(&(thread, peer)) {
            return Ok(false);
        }

        let session = RatchetSession::establish(
            &self.identity,
            remote,
            &thread.to_bytes(),
            fresh_secret,
            self.limits,
        )?;
        let role = session.role();

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&(thread, peer)) {
            return Ok(false);
        }
        sessions.insert((thread, peer), Arc::new(Mutex::new(session)));
        drop(sessions);

        tracing::debug!(thread = %thread, peer = %peer, ?role, "session established");
        Ok(true)
    }

    /// Step the sending chain of an established session.
    ///
    /// Concurrent callers on the same session receive distinct counters and
    /// keys.
    pub fn ratchet_send(
        &self,
        thread: ThreadId,
        peer: ParticipantId,
    ) -> Result<(RatchetHeader, MessageKey), CoreError> {
        let session = self.session(thread, peer)?;
        let mut session = session.lock();
        Ok(session.ratchet_send()?)
    }

    /// Derive the key for `header` and commit the state change.
    ///
    /// Prefer [`decrypt`](Self::decrypt), which commits only after the
    /// message authenticates.
    pub fn ratchet_receive(
        &self,
        thread: ThreadId,
        peer: ParticipantId,
        header: &RatchetHeader,
        fresh_secret: impl FnOnce() -> [u8; 32],
    ) -> Result<MessageKey, CoreError> {
        let session = self.session(thread, peer)?;
        let mut session = session.lock();
        Ok(session.ratchet_receive(header, fresh_secret)?)
    }

    /// Seal `plaintext` for `peer`, binding `context` into the tag.
    pub fn encrypt(
        &self,
        thread: ThreadId,
        peer: ParticipantId,
        context: &[u8],
        plaintext: &[u8],
    ) -> Result<(RatchetHeader, Vec<u8>), CoreError> {
        let session = self.session(thread, peer)?;
        let mut session = session.lock();
        Ok(session.encrypt(context, plaintext)?)
    }

    /// Open a message from `peer`. The session only changes on success.
    pub fn decrypt(
        &self,
        thread: ThreadId,
        peer: ParticipantId,
        header: &RatchetHeader,
        context: &[u8],
        sealed: &[u8],
        fresh_secret: impl FnOnce() -> [u8; 32],
    ) -> Result<Vec<u8>, CoreError> {
        let session = self.session(thread, peer)?;
        let mut session = session.lock();
        Ok(session.decrypt(header, context, sealed, fresh_secret)?)
    }

    /// Drop every session scoped to `thread`. Returns how many were dropped.
    pub fn evict_thread(&self, thread: ThreadId) -> usize {
        let evicted = self.evict_where(|(owner, _)| *owner == thread);
        if evicted > 0 {
            tracing::debug!(thread = %thread, evicted, "thread sessions evicted");
        }
        evicted
    }

    /// Drop every session with `peer`. Returns how many were dropped.
    pub fn evict_peer(&self, peer: ParticipantId) -> usize {
        let evicted = self.evict_where(|(_, remote)| *remote == peer);
        if evicted > 0 {
            tracing::debug!(peer = %peer, evicted, "peer sessions evicted");
        }
        evicted
    }

    /// Drop every session.
    pub fn clear(&self) {
        self.sessions.write().clear();
    }

    /// True if a session with `peer` exists in `thread`.
    pub fn has_session(&self, thread: ThreadId, peer: ParticipantId) -> bool {
        self.sessions.read().contains_key(&(thread, peer))
    }

    /// Number of established sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Skipped keys evicted across all live sessions.
    pub fn evicted_keys(&self) -> u64 {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions.iter().map(|session| session.lock().evicted_keys()).sum()
    }

    /// Counter the next message to `peer` in `thread` will carry.
    pub fn sending_counter(&self, thread: ThreadId, peer: ParticipantId) -> Option<u32> {
        let session = self.sessions.read().get(&(thread, peer)).cloned()?;
        let counter = session.lock().sending_counter();
        Some(counter)
    }

    fn session(
        &self,
        thread: ThreadId,
        peer: ParticipantId,
    ) -> Result<Arc<Mutex<RatchetSession>>, CoreError> {
        self.sessions
            .read()
            .get(&(thread, peer))
            .cloned()
            .ok_or(CoreError::NoSession { thread, peer })
    }

    fn evict_where(&self, predicate: impl Fn(&SessionKey) -> bool) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|key, _| !predicate(key));
        before - sessions.len()
    }
}

impl std::fmt::Debug for RatchetEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetEngine")
            .field("participant", &self.participant)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}
