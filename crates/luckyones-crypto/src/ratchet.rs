//! Double ratchet session state machine
//!
//! A [`RatchetSession`] exists only once key agreement has succeeded; the
//! absence of a session is the uninitialized state. Sending steps the
//! symmetric chain. Receiving steps it too, and performs a DH ratchet step
//! whenever the peer presents a new ratchet key.
//!
//! # Transactional receive
//!
//! [`RatchetSession::plan_receive`] computes everything a receive would
//! change without touching `self`. [`RatchetSession::commit`] applies it.
//! [`RatchetSession::decrypt`] commits only after the AEAD tag verifies, so
//! a forged or corrupted message never advances a chain, evicts a cached
//! key or rotates the root.

use std::{collections::VecDeque, fmt};

use zeroize::{Zeroize, Zeroizing};

use crate::{
    aead::{NONCE_SIZE, open, seal},
    chain::{ChainKey, MessageKey},
    error::CryptoError,
    kdf::{derive_root_step, derive_session_seed},
    key_exchange::{KeyPair, PUBLIC_KEY_SIZE, PublicKey},
    skipped::SkippedKeys,
};

/// Remote ratchet keys remembered after their epoch ends.
///
/// A message under one of these is a replay of an old epoch, not a new DH
/// step.
const MAX_RETIRED_KEYS: usize = 32;

/// Header sent in the clear alongside every ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key
    pub ratchet_key: PublicKey,
    /// Number of messages in the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Position of this message in the current sending chain
    pub counter: u32,
}

impl RatchetHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = PUBLIC_KEY_SIZE + 8;

    /// Big-endian encoding: `ratchet_key || previous_chain_length || counter`.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..32].copy_from_slice(self.ratchet_key.as_bytes());
        bytes[32..36].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        bytes[36..].copy_from_slice(&self.counter.to_be_bytes());
        bytes
    }

    /// Inverse of [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut key = [0u8; PUBLIC_KEY_SIZE];
        key.copy_from_slice(&bytes[..32]);
        let mut previous = [0u8; 4];
        previous.copy_from_slice(&bytes[32..36]);
        let mut counter = [0u8; 4];
        counter.copy_from_slice(&bytes[36..]);

        Self {
            ratchet_key: PublicKey::from_bytes(key),
            previous_chain_length: u32::from_be_bytes(previous),
            counter: u32::from_be_bytes(counter),
        }
    }

    /// AEAD nonce: `counter || previous_chain_length || 0u32`.
    ///
    /// Unique per message key by construction.
    pub fn nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..4].copy_from_slice(&self.counter.to_be_bytes());
        nonce[4..8].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        nonce
    }

    /// Associated data bound into the tag: the encoded header followed by
    /// the caller's routing context.
    pub fn associated_data(&self, context: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(Self::SIZE + context.len());
        aad.extend_from_slice(&self.to_bytes());
        aad.extend_from_slice(context);
        aad
    }
}

/// Memory bounds for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Most counters a single receive may skip in one chain
    pub max_skip: u32,
    /// Capacity of the skipped-key cache
    pub max_skipped_keys: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self { max_skip: 1000, max_skipped_keys: 1000 }
    }
}

/// Which side of the initial handshake a participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Lower identity key; first sending epoch uses the identity key
    Initiator,
    /// Higher identity key; opens its sending epoch with a fresh ratchet key
    Responder,
}

impl Role {
    /// Roles are fixed by byte-wise order of the two identity keys.
    pub fn for_pair(local: &PublicKey, remote: &PublicKey) -> Self {
        if local < remote { Self::Initiator } else { Self::Responder }
    }
}

/// A pending receive, computed but not yet applied.
///
/// Must be committed to the session it was planned on, before any other
/// mutation of that session.
pub struct ReceivePlan {
    key: MessageKey,
    change: PlannedChange,
}

impl ReceivePlan {
    /// Key that will open the message.
    pub fn message_key(&self) -> &MessageKey {
        &self.key
    }

    /// True if committing performs a DH ratchet step.
    pub fn performs_dh_step(&self) -> bool {
        matches!(self.change, PlannedChange::Step(_))
    }
}

impl fmt::Debug for ReceivePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivePlan")
            .field("counter", &self.key.counter())
            .field("dh_step", &self.performs_dh_step())
            .finish()
    }
}

enum PlannedChange {
    ConsumeSkipped { ratchet_key: PublicKey, counter: u32 },
    Advance { receiving: ChainKey, skipped: Vec<MessageKey> },
    Step(Box<DhStep>),
}

struct DhStep {
    root_key: Zeroizing<[u8; 32]>,
    self_ratchet: KeyPair,
    remote_ratchet: PublicKey,
    sending: ChainKey,
    receiving: ChainKey,
    previous_sending_length: u32,
    old_chain_skipped: Vec<MessageKey>,
    new_chain_skipped: Vec<MessageKey>,
}

/// Established double ratchet session with one remote participant.
pub struct RatchetSession {
    role: Role,
    root_key: Zeroizing<[u8; 32]>,
    self_ratchet: KeyPair,
    remote_ratchet: PublicKey,
    sending: ChainKey,
    receiving: Option<ChainKey>,
    previous_sending_length: u32,
    skipped: SkippedKeys,
    retired_remote: VecDeque<PublicKey>,
    limits: SessionLimits,
}

impl RatchetSession {
    /// Run key agreement against `remote_identity` and seed the session.
    ///
    /// `context` scopes the session (thread id bytes). `fresh_secret` seeds
    /// the responder's first ratchet key pair and is discarded by the
    /// initiator.
    ///
    /// # Errors
    ///
    /// - `InvalidKey`: remote key is low-order or equal to our own
    pub fn establish(
        identity: &KeyPair,
        remote_identity: &PublicKey,
        context: &[u8],
        mut fresh_secret: [u8; 32],
        limits: SessionLimits,
    ) -> Result<Self, CryptoError> {
        let local = identity.public_key();
        if local == *remote_identity {
            fresh_secret.zeroize();
            return Err(CryptoError::InvalidKey { reason: "remote key equals local key" });
        }

        let shared = identity.agree(remote_identity)?;
        let seed = Zeroizing::new(derive_session_seed(&shared, context));
        let (root_key, first_chain) = derive_root_step(&seed, &shared);
        let root_key = Zeroizing::new(root_key);
        let role = Role::for_pair(&local, remote_identity);

        let session = match role {
            Role::Initiator => {
                fresh_secret.zeroize();
                Self {
                    role,
                    root_key,
                    self_ratchet: identity.clone(),
                    remote_ratchet: *remote_identity,
                    sending: ChainKey::new(first_chain),
                    receiving: None,
                    previous_sending_length: 0,
                    skipped: SkippedKeys::new(limits.max_skipped_keys),
                    retired_remote: VecDeque::new(),
                    limits,
                }
            },
            Role::Responder => {
                let ratchet = KeyPair::from_secret_bytes(fresh_secret);
                let dh = ratchet.agree(remote_identity)?;
                let (next_root, sending_chain) = derive_root_step(&root_key, &dh);
                Self {
                    role,
                    root_key: Zeroizing::new(next_root),
                    self_ratchet: ratchet,
                    remote_ratchet: *remote_identity,
                    sending: ChainKey::new(sending_chain),
                    receiving: Some(ChainKey::new(first_chain)),
                    previous_sending_length: 0,
                    skipped: SkippedKeys::new(limits.max_skipped_keys),
                    retired_remote: VecDeque::new(),
                    limits,
                }
            },
        };

        Ok(session)
    }

    /// Side of the handshake this session plays.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Counter the next sent message will carry.
    pub fn sending_counter(&self) -> u32 {
        self.sending.counter()
    }

    /// Next expected counter on the current receiving chain, if any.
    pub fn receiving_counter(&self) -> Option<u32> {
        self.receiving.as_ref().map(ChainKey::counter)
    }

    /// Our current ratchet public key.
    pub fn ratchet_public_key(&self) -> PublicKey {
        self.self_ratchet.public_key()
    }

    /// Peer's most recently seen ratchet public key.
    pub fn remote_ratchet_key(&self) -> PublicKey {
        self.remote_ratchet
    }

    /// Keys currently held for out-of-order delivery.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Skipped keys dropped because the cache was full.
    pub fn evicted_keys(&self) -> u64 {
        self.skipped.evicted()
    }

    /// Step the sending chain.
    ///
    /// Returns the header to transmit and the one-time key for this message.
    pub fn ratchet_send(&mut self) -> Result<(RatchetHeader, MessageKey), CryptoError> {
        let header = RatchetHeader {
            ratchet_key: self.self_ratchet.public_key(),
            previous_chain_length: self.previous_sending_length,
            counter: self.sending.counter(),
        };
        let key = self.sending.advance()?;
        Ok((header, key))
    }

    /// Derive the key for `header` and apply the state change immediately.
    ///
    /// Prefer [`decrypt`](Self::decrypt), which only commits once the
    /// message authenticates.
    pub fn ratchet_receive(
        &mut self,
        header: &RatchetHeader,
        fresh_secret: impl FnOnce() -> [u8; 32],
    ) -> Result<MessageKey, CryptoError> {
        let plan = self.plan_receive(header, fresh_secret)?;
        Ok(self.commit(plan))
    }

    /// Seal `plaintext` under the next sending key.
    ///
    /// `context` is bound into the tag after the header.
    pub fn encrypt(
        &mut self,
        context: &[u8],
        plaintext: &[u8],
    ) -> Result<(RatchetHeader, Vec<u8>), CryptoError> {
        let (header, key) = self.ratchet_send()?;
        let aad = header.associated_data(context);
        Ok((header, seal(key.key(), &header.nonce(), &aad, plaintext)))
    }

    /// Open a message. Session state changes only on success.
    ///
    /// # Errors
    ///
    /// - `Authentication`: tag mismatch; nothing is advanced
    /// - `Duplicate`: counter already consumed
    /// - `Deferred`: gap exceeds the skip limit
    /// - `InvalidKey`: header carries a low-order ratchet key
    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        context: &[u8],
        sealed: &[u8],
        fresh_secret: impl FnOnce() -> [u8; 32],
    ) -> Result<Vec<u8>, CryptoError> {
        let plan = self.plan_receive(header, fresh_secret)?;
        let aad = header.associated_data(context);
        let plaintext = open(plan.key.key(), &header.nonce(), &aad, sealed)?;
        self.commit(plan);
        Ok(plaintext)
    }

    /// Compute the receive for `header` without changing the session.
    ///
    /// `fresh_secret` is only called when a DH ratchet step is needed.
    pub fn plan_receive(
        &self,
        header: &RatchetHeader,
        fresh_secret: impl FnOnce() -> [u8; 32],
    ) -> Result<ReceivePlan, CryptoError> {
        if let Some(key) = self.skipped.get(&header.ratchet_key, header.counter) {
            return Ok(ReceivePlan {
                key: key.clone(),
                change: PlannedChange::ConsumeSkipped {
                    ratchet_key: header.ratchet_key,
                    counter: header.counter,
                },
            });
        }

        if header.ratchet_key == self.remote_ratchet {
            let Some(receiving) = &self.receiving else {
                return Err(CryptoError::NoReceivingChain);
            };
            let mut receiving = receiving.clone();
            let (skipped, key) = self.walk_to(&mut receiving, header.counter)?;
            return Ok(ReceivePlan { key, change: PlannedChange::Advance { receiving, skipped } });
        }

        if self.retired_remote.contains(&header.ratchet_key) {
            return Err(CryptoError::Duplicate { counter: header.counter });
        }

        // Close out the previous receiving chain up to the sender's count
        let mut old_chain_skipped = Vec::new();
        if let Some(receiving) = &self.receiving {
            let mut old = receiving.clone();
            let end = header.previous_chain_length;
            let gap = end.saturating_sub(old.counter());
            if gap > self.limits.max_skip {
                return Err(CryptoError::Deferred {
                    counter: header.counter,
                    gap,
                    limit: self.limits.max_skip,
                });
            }
            while old.counter() < end {
                old_chain_skipped.push(old.advance()?);
            }
        }

        if header.counter > self.limits.max_skip {
            return Err(CryptoError::Deferred {
                counter: header.counter,
                gap: header.counter,
                limit: self.limits.max_skip,
            });
        }

        let receive_dh = self.self_ratchet.agree(&header.ratchet_key)?;
        let (root_key, receiving_chain) = derive_root_step(&self.root_key, &receive_dh);
        let mut receiving = ChainKey::new(receiving_chain);
        let (new_chain_skipped, key) = receiving.advance_to(header.counter)?;

        let self_ratchet = KeyPair::from_secret_bytes(fresh_secret());
        let send_dh = self_ratchet.agree(&header.ratchet_key)?;
        let (next_root, sending_chain) = derive_root_step(&root_key, &send_dh);

        let step = DhStep {
            root_key: Zeroizing::new(next_root),
            self_ratchet,
            remote_ratchet: header.ratchet_key,
            sending: ChainKey::new(sending_chain),
            receiving,
            previous_sending_length: self.sending.counter(),
            old_chain_skipped,
            new_chain_skipped,
        };

        Ok(ReceivePlan { key, change: PlannedChange::Step(Box::new(step)) })
    }

    /// Apply a plan from [`plan_receive`](Self::plan_receive) and hand back
    /// its message key.
    pub fn commit(&mut self, plan: ReceivePlan) -> MessageKey {
        let ReceivePlan { key, change } = plan;

        match change {
            PlannedChange::ConsumeSkipped { ratchet_key, counter } => {
                self.skipped.take(&ratchet_key, counter);
            },
            PlannedChange::Advance { receiving, skipped } => {
                for skipped_key in skipped {
                    self.skipped.insert(self.remote_ratchet, skipped_key);
                }
                self.receiving = Some(receiving);
            },
            PlannedChange::Step(step) => {
                let DhStep {
                    root_key,
                    self_ratchet,
                    remote_ratchet,
                    sending,
                    receiving,
                    previous_sending_length,
                    old_chain_skipped,
                    new_chain_skipped,
                } = *step;

                let retired = self.remote_ratchet;
                for skipped_key in old_chain_skipped {
                    self.skipped.insert(retired, skipped_key);
                }
                for skipped_key in new_chain_skipped {
                    self.skipped.insert(remote_ratchet, skipped_key);
                }

                self.retired_remote.push_back(retired);
                if self.retired_remote.len() > MAX_RETIRED_KEYS {
                    self.retired_remote.pop_front();
                }

                self.root_key = root_key;
                self.self_ratchet = self_ratchet;
                self.remote_ratchet = remote_ratchet;
                self.sending = sending;
                self.receiving = Some(receiving);
                self.previous_sending_length = previous_sending_length;
            },
        }

        key
    }

    fn walk_to(
        &self,
        chain: &mut ChainKey,
        counter: u32,
    ) -> Result<(Vec<MessageKey>, MessageKey), CryptoError> {
        if counter < chain.counter() {
            return Err(CryptoError::Duplicate { counter });
        }
        let gap = counter - chain.counter();
        if gap > self.limits.max_skip {
            return Err(CryptoError::Deferred { counter, gap, limit: self.limits.max_skip });
        }
        chain.advance_to(counter)
    }
}

impl fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetSession")
            .field("role", &self.role)
            .field("ratchet_key", &self.self_ratchet.public_key())
            .field("remote_ratchet", &self.remote_ratchet)
            .field("sending", &self.sending.counter())
            .field("receiving", &self.receiving_counter())
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}
