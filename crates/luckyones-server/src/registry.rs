//! Connection registry.
//!
//! Maps transport connections to the participants announced on them. A
//! connection exists from accept until close; it is bound to a participant
//! between JOIN and LEAVE (or close). One connection per participant.

use std::collections::HashMap;

use luckyones_core::ParticipantId;
use luckyones_crypto::PublicKey;

use crate::server_error::RelayError;

/// A participant announced on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    /// Participant id, derived from `public_key`
    pub participant: ParticipantId,
    /// Long-term public key
    pub public_key: PublicKey,
    /// Display name
    pub username: String,
}

/// Registry of open connections and their bound participants.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Connection id → bound participant, if joined
    connections: HashMap<u64, Option<Presence>>,
    /// Participant → connection (reverse index)
    participants: HashMap<ParticipantId, u64>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection.
    ///
    /// Returns `false` if the id is already registered.
    pub fn register(&mut self, connection_id: u64) -> bool {
        if self.connections.contains_key(&connection_id) {
            return false;
        }
        self.connections.insert(connection_id, None);
        true
    }

    /// Remove a connection. Returns its presence if it had joined.
    ///
    /// `None` also for unknown connections; see [`Self::has_connection`].
    pub fn unregister(&mut self, connection_id: u64) -> Option<Presence> {
        let presence = self.connections.remove(&connection_id)??;
        self.participants.remove(&presence.participant);
        Some(presence)
    }

    /// Bind a participant to a connection.
    ///
    /// # Errors
    ///
    /// - `ConnectionNotFound` if the connection is not registered
    /// - `AlreadyJoined` if the connection is already bound
    /// - `ParticipantConnected` if the participant is bound elsewhere
    pub fn bind(&mut self, connection_id: u64, presence: Presence) -> Result<(), RelayError> {
        let slot = self
            .connections
            .get_mut(&connection_id)
            .ok_or(RelayError::ConnectionNotFound(connection_id))?;
        if slot.is_some() {
            return Err(RelayError::AlreadyJoined(connection_id));
        }
        if self.participants.contains_key(&presence.participant) {
            return Err(RelayError::ParticipantConnected(presence.participant));
        }

        self.participants.insert(presence.participant, connection_id);
        *slot = Some(presence);
        Ok(())
    }

    /// Unbind a connection's participant, keeping the connection open.
    pub fn unbind(&mut self, connection_id: u64) -> Option<Presence> {
        let presence = self.connections.get_mut(&connection_id)?.take()?;
        self.participants.remove(&presence.participant);
        Some(presence)
    }

    /// True if the connection is registered.
    pub fn has_connection(&self, connection_id: u64) -> bool {
        self.connections.contains_key(&connection_id)
    }

    /// Participant bound to a connection.
    pub fn participant(&self, connection_id: u64) -> Option<ParticipantId> {
        self.connections.get(&connection_id)?.as_ref().map(|presence| presence.participant)
    }

    /// Connection a participant is bound to.
    pub fn connection_for(&self, participant: ParticipantId) -> Option<u64> {
        self.participants.get(&participant).copied()
    }

    /// Every joined participant, ordered by id.
    pub fn presences(&self) -> Vec<Presence> {
        let mut presences: Vec<_> = self.connections.values().flatten().cloned().collect();
        presences.sort_unstable_by_key(|presence| presence.participant);
        presences
    }

    /// Connections of every joined participant, ordered by participant.
    pub fn joined(&self) -> Vec<(ParticipantId, u64)> {
        let mut joined: Vec<_> =
            self.participants.iter().map(|(participant, conn)| (*participant, *conn)).collect();
        joined.sort_unstable();
        joined
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True if no connections are open.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(seed: u8) -> Presence {
        let public_key = PublicKey::from_bytes([seed; 32]);
        Presence {
            participant: ParticipantId::from_public_key(&public_key),
            public_key,
            username: format!("user{seed}"),
        }
    }

    #[test]
    fn bind_and_unregister() {
        let mut registry = ConnectionRegistry::new();
        assert!(registry.register(1));
        assert!(!registry.register(1));

        let alice = presence(1);
        registry.bind(1, alice.clone()).unwrap();
        assert_eq!(registry.participant(1), Some(alice.participant));
        assert_eq!(registry.connection_for(alice.participant), Some(1));

        assert_eq!(registry.unregister(1), Some(alice.clone()));
        assert_eq!(registry.connection_for(alice.participant), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn one_connection_per_participant() {
        let mut registry = ConnectionRegistry::new();
        registry.register(1);
        registry.register(2);

        let alice = presence(1);
        registry.bind(1, alice.clone()).unwrap();
        assert_eq!(
            registry.bind(2, alice.clone()),
            Err(RelayError::ParticipantConnected(alice.participant))
        );
        assert_eq!(registry.bind(1, presence(2)), Err(RelayError::AlreadyJoined(1)));
    }

    #[test]
    fn unbind_keeps_connection() {
        let mut registry = ConnectionRegistry::new();
        registry.register(1);
        registry.bind(1, presence(1)).unwrap();

        assert!(registry.unbind(1).is_some());
        assert!(registry.has_connection(1));
        assert_eq!(registry.participant(1), None);
        assert!(registry.unbind(1).is_none());
    }

    #[test]
    fn bind_unknown_connection() {
        let mut registry = ConnectionRegistry::new();
        assert_eq!(registry.bind(9, presence(1)), Err(RelayError::ConnectionNotFound(9)));
    }
}
