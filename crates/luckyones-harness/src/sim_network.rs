//! In-memory network of one relay and many clients.
//!
//! Frames never touch a socket: a client's [`RouterAction::Send`] becomes a
//! [`RelayEvent::FrameReceived`], and every [`RelayAction::SendToConnection`]
//! is handed to the target client's router. Everything else a router emits
//! lands in that client's inbox for the test to inspect.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
};

use luckyones_core::{
    CoreConfig, CoreError, DeliveredMessage, Environment, MemoryAttachmentStore, MessageRouter,
    ParticipantId, RouterAction,
};
use luckyones_crypto::KeyPair;
use luckyones_server::{RelayAction, RelayConfig, RelayDriver, RelayError, RelayEvent};

use crate::{SimEnv, SimInstant};

/// Client router as used in simulation.
pub type SimRouter = MessageRouter<SimEnv, MemoryAttachmentStore>;

/// Handle to a simulated client, equal to its relay connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientHandle(pub u64);

/// Error raised while pumping the simulated network.
#[derive(Debug, Clone, PartialEq)]
pub enum SimError {
    /// The relay rejected an event
    Relay(RelayError),
    /// A client router rejected a frame
    Router(CoreError),
    /// No client with this handle is connected
    UnknownClient(ClientHandle),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay(e) => write!(f, "relay: {e}"),
            Self::Router(e) => write!(f, "router: {e}"),
            Self::UnknownClient(handle) => write!(f, "unknown client {}", handle.0),
        }
    }
}

impl std::error::Error for SimError {}

impl From<RelayError> for SimError {
    fn from(e: RelayError) -> Self {
        Self::Relay(e)
    }
}

impl From<CoreError> for SimError {
    fn from(e: CoreError) -> Self {
        Self::Router(e)
    }
}

struct SimClient {
    router: SimRouter,
    inbox: Vec<RouterAction<SimInstant>>,
}

enum Pending {
    FromClient(ClientHandle, RouterAction<SimInstant>),
    FromRelay(RelayAction),
}

/// Deterministic relay plus clients sharing one [`SimEnv`].
pub struct SimNetwork {
    env: SimEnv,
    config: CoreConfig,
    relay: RelayDriver<SimEnv>,
    clients: BTreeMap<ClientHandle, SimClient>,
    next_connection: u64,
}

impl SimNetwork {
    /// Network with default lifetimes.
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, CoreConfig::default())
    }

    /// Network where the relay and every client share `config`.
    pub fn with_config(seed: u64, config: CoreConfig) -> Self {
        let env = SimEnv::with_seed(seed);
        let relay_config = RelayConfig { core: config, ..Default::default() };
        let relay = RelayDriver::new(env.clone(), relay_config);
        Self { env, config, relay, clients: BTreeMap::new(), next_connection: 1 }
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// The relay.
    pub fn relay(&self) -> &RelayDriver<SimEnv> {
        &self.relay
    }

    /// Connect a new client and announce it on the main thread.
    pub fn connect(&mut self, username: &str) -> Result<ClientHandle, SimError> {
        let handle = ClientHandle(self.next_connection);
        self.next_connection += 1;

        let identity = KeyPair::from_secret_bytes(self.env.random_key());
        let router = MessageRouter::new(
            self.env.clone(),
            identity,
            username,
            self.config,
            MemoryAttachmentStore::new(),
        );
        self.clients.insert(handle, SimClient { router, inbox: Vec::new() });

        let accepted =
            self.relay.process_event(RelayEvent::ConnectionAccepted { connection_id: handle.0 })?;
        self.pump(accepted.into_iter().map(Pending::FromRelay).collect())?;

        let join = self.router(handle)?.join_network()?;
        self.submit(handle, join)?;

        tracing::debug!(client = handle.0, username, "client connected");
        Ok(handle)
    }

    /// Drop a client's connection.
    pub fn disconnect(&mut self, handle: ClientHandle) -> Result<(), SimError> {
        self.clients.remove(&handle).ok_or(SimError::UnknownClient(handle))?;
        let actions = self.relay.process_event(RelayEvent::ConnectionClosed {
            connection_id: handle.0,
            reason: "disconnected".to_string(),
        })?;
        self.pump(actions.into_iter().map(Pending::FromRelay).collect())
    }

    /// A client's router.
    pub fn router(&self, handle: ClientHandle) -> Result<&SimRouter, SimError> {
        self.clients.get(&handle).map(|c| &c.router).ok_or(SimError::UnknownClient(handle))
    }

    /// Participant id of a client.
    pub fn participant(&self, handle: ClientHandle) -> Result<ParticipantId, SimError> {
        Ok(self.router(handle)?.participant_id())
    }

    /// Feed actions a client's router produced into the network and run
    /// until no frame is in flight.
    pub fn submit(
        &mut self,
        handle: ClientHandle,
        actions: Vec<RouterAction<SimInstant>>,
    ) -> Result<(), SimError> {
        self.pump(actions.into_iter().map(|a| Pending::FromClient(handle, a)).collect())
    }

    /// Everything a client's router surfaced since the last call.
    pub fn take_inbox(
        &mut self,
        handle: ClientHandle,
    ) -> Result<Vec<RouterAction<SimInstant>>, SimError> {
        let client = self.clients.get_mut(&handle).ok_or(SimError::UnknownClient(handle))?;
        Ok(std::mem::take(&mut client.inbox))
    }

    /// Messages delivered to a client since the last inbox read.
    ///
    /// Drains the whole inbox.
    pub fn take_delivered(
        &mut self,
        handle: ClientHandle,
    ) -> Result<Vec<DeliveredMessage>, SimError> {
        Ok(self
            .take_inbox(handle)?
            .into_iter()
            .filter_map(|action| match action {
                RouterAction::Deliver(message) => Some(message),
                _ => None,
            })
            .collect())
    }

    /// Move the shared clock forward without ticking anyone.
    pub fn advance(&self, duration: std::time::Duration) {
        self.env.advance(duration);
    }

    /// Tick the relay, then every client in handle order.
    pub fn tick_all(&mut self) -> Result<(), SimError> {
        let relay = self.relay.process_event(RelayEvent::Tick)?;
        self.pump(relay.into_iter().map(Pending::FromRelay).collect())?;

        let handles: Vec<ClientHandle> = self.clients.keys().copied().collect();
        for handle in handles {
            let actions = self.router(handle)?.tick();
            self.submit(handle, actions)?;
        }
        Ok(())
    }

    fn pump(&mut self, initial: VecDeque<Pending>) -> Result<(), SimError> {
        let mut queue = initial;
        while let Some(item) = queue.pop_front() {
            match item {
                Pending::FromClient(handle, RouterAction::Send(frame)) => {
                    let actions = self.relay.process_event(RelayEvent::FrameReceived {
                        connection_id: handle.0,
                        frame,
                    })?;
                    queue.extend(actions.into_iter().map(Pending::FromRelay));
                },
                Pending::FromClient(handle, action) => {
                    if let Some(client) = self.clients.get_mut(&handle) {
                        client.inbox.push(action);
                    }
                },
                Pending::FromRelay(RelayAction::SendToConnection { connection_id, frame }) => {
                    let handle = ClientHandle(connection_id);
                    let Some(client) = self.clients.get(&handle) else {
                        continue;
                    };
                    let actions = client.router.handle_frame(&frame)?;
                    queue.extend(actions.into_iter().map(|a| Pending::FromClient(handle, a)));
                },
                Pending::FromRelay(RelayAction::CloseConnection { connection_id, reason }) => {
                    tracing::debug!(connection_id, reason, "relay closed connection");
                    self.clients.remove(&ClientHandle(connection_id));
                },
            }
        }
        Ok(())
    }
}
