//! LuckyOnes relay server.
//!
//! Production runtime around [`RelayDriver`]: TCP transport, Tokio tasks and
//! system time with OS randomness.
//!
//! # Architecture
//!
//! The [`RelayDriver`] is Sans-IO. [`Server`] reads frames off sockets,
//! feeds them to the driver as [`RelayEvent`]s and executes the returned
//! [`RelayAction`]s. Each connection owns a reader task and a writer task
//! joined by a bounded queue, so no driver lock is held across a write.
//!
//! # Components
//!
//! - [`RelayDriver`]: action-based relay (pure logic, no I/O)
//! - [`Server`]: production runtime executing driver actions
//! - [`TcpTransport`]: TCP listener with length-delimited frame I/O
//! - [`SystemEnv`]: production environment (real time, crypto RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod error;
mod registry;
mod server_error;
mod system_env;
mod transport;

use std::{collections::HashMap, sync::Arc, time::Duration};

pub use driver::{RelayAction, RelayConfig, RelayDriver, RelayEvent};
pub use error::ServerError;
use luckyones_core::Environment;
use luckyones_proto::Frame;
use parking_lot::RwLock;
pub use registry::{ConnectionRegistry, Presence};
pub use server_error::RelayError;
pub use system_env::SystemEnv;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{Notify, mpsc},
};
pub use transport::{TcpTransport, read_frame, write_frame};

/// Frames buffered per connection before the relay starts dropping.
const OUTBOUND_QUEUE: usize = 256;

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:6660")
    pub bind_address: String,
    /// How often expired threads and attachments are swept
    pub tick_interval: Duration,
    /// Driver configuration (lifetimes, limits)
    pub relay: RelayConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:6660".to_string(),
            tick_interval: Duration::from_secs(1),
            relay: RelayConfig::default(),
        }
    }
}

/// Writer side of one connection.
struct Outbound {
    frames: mpsc::Sender<Frame>,
    closed: Arc<Notify>,
}

/// Outbound queues shared by all connection tasks.
#[derive(Default)]
struct SharedState {
    outbound: RwLock<HashMap<u64, Outbound>>,
}

/// Production LuckyOnes relay.
///
/// Wraps [`RelayDriver`] with TCP transport and system environment.
pub struct Server {
    driver: Arc<RelayDriver<SystemEnv>>,
    transport: TcpTransport,
    env: SystemEnv,
    tick_interval: Duration,
}

impl Server {
    /// Create and bind a new server.
    ///
    /// # Errors
    ///
    /// - `Config` if the address is invalid or the tick interval is zero
    /// - `Transport` if the socket cannot be bound
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        if config.tick_interval.is_zero() {
            return Err(ServerError::Config("tick interval must be non-zero".to_string()));
        }

        let env = SystemEnv::new();
        let driver = Arc::new(RelayDriver::new(env, config.relay));
        let transport = TcpTransport::bind(&config.bind_address).await?;

        Ok(Self { driver, transport, env, tick_interval: config.tick_interval })
    }

    /// Run the server, accepting connections and sweeping deadlines.
    ///
    /// Runs until the process is shut down; accept errors are logged.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.transport.local_addr()?);

        let shared = Arc::new(SharedState::default());

        {
            let driver = Arc::clone(&self.driver);
            let shared = Arc::clone(&shared);
            let period = self.tick_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    dispatch(&driver, &shared, RelayEvent::Tick);
                }
            });
        }

        loop {
            match self.transport.accept().await {
                Ok((stream, peer)) => {
                    let driver = Arc::clone(&self.driver);
                    let shared = Arc::clone(&shared);
                    let env = self.env;

                    tracing::debug!(%peer, "accepted connection");

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &driver, &shared, env).await {
                            tracing::debug!(%peer, "connection error: {}", e);
                        }
                    });
                },
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                },
            }
        }
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// The relay driver.
    pub fn driver(&self) -> &RelayDriver<SystemEnv> {
        &self.driver
    }
}

/// Handle a single TCP connection until either side closes it.
async fn handle_connection(
    stream: TcpStream,
    driver: &RelayDriver<SystemEnv>,
    shared: &SharedState,
    env: SystemEnv,
) -> Result<(), ServerError> {
    let (reader, writer) = stream.into_split();
    let (frames, queue) = mpsc::channel(OUTBOUND_QUEUE);
    let closed = Arc::new(Notify::new());

    let connection_id = {
        let mut outbound = shared.outbound.write();
        let mut connection_id = env.random_u64();
        while outbound.contains_key(&connection_id) {
            connection_id = env.random_u64();
        }
        outbound.insert(connection_id, Outbound { frames, closed: Arc::clone(&closed) });
        connection_id
    };

    let writer_task = tokio::spawn(write_loop(connection_id, writer, queue));

    let actions = match driver.process_event(RelayEvent::ConnectionAccepted { connection_id }) {
        Ok(actions) => actions,
        Err(e) => {
            shared.outbound.write().remove(&connection_id);
            return Err(e.into());
        },
    };
    let admitted =
        !actions.iter().any(|action| matches!(action, RelayAction::CloseConnection { .. }));
    execute_actions(shared, actions);

    let result = read_loop(connection_id, reader, driver, shared, &closed).await;

    shared.outbound.write().remove(&connection_id);
    if admitted {
        let reason = match &result {
            Ok(()) => "connection closed".to_string(),
            Err(e) => e.to_string(),
        };
        dispatch(driver, shared, RelayEvent::ConnectionClosed { connection_id, reason });
    }

    // Removing the queue sender ends the writer once it drains.
    if let Err(e) = writer_task.await {
        tracing::debug!(connection_id, "writer task failed: {}", e);
    }

    result
}

/// Read frames and feed them to the driver until EOF or a forced close.
async fn read_loop<R>(
    connection_id: u64,
    mut reader: R,
    driver: &RelayDriver<SystemEnv>,
    shared: &SharedState,
    closed: &Notify,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            () = closed.notified() => return Ok(()),
            frame = read_frame(&mut reader) => frame?,
        };

        let Some(frame) = frame else {
            return Ok(());
        };

        dispatch(driver, shared, RelayEvent::FrameReceived { connection_id, frame });
    }
}

/// Drain one connection's queue onto its socket.
async fn write_loop<W>(connection_id: u64, mut writer: W, mut queue: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = queue.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::debug!(connection_id, "write failed: {}", e);
            break;
        }
    }
}

/// Process one event and execute the resulting actions.
fn dispatch(driver: &RelayDriver<SystemEnv>, shared: &SharedState, event: RelayEvent) {
    match driver.process_event(event) {
        Ok(actions) => execute_actions(shared, actions),
        Err(e) => tracing::warn!("Event processing error: {}", e),
    }
}

/// Execute relay actions.
///
/// Only enqueues; the writer tasks perform the socket I/O.
fn execute_actions(shared: &SharedState, actions: Vec<RelayAction>) {
    for action in actions {
        match action {
            RelayAction::SendToConnection { connection_id, frame } => {
                let outbound = shared.outbound.read();
                let Some(target) = outbound.get(&connection_id) else {
                    tracing::debug!(connection_id, "send to unknown connection dropped");
                    continue;
                };
                if let Err(e) = target.frames.try_send(frame) {
                    tracing::warn!(connection_id, "outbound queue rejected frame: {}", e);
                }
            },

            RelayAction::CloseConnection { connection_id, reason } => {
                tracing::info!("Closing connection {}: {}", connection_id, reason);
                if let Some(target) = shared.outbound.read().get(&connection_id) {
                    target.closed.notify_one();
                }
            },
        }
    }
}
