//! Server error types.

use thiserror::Error;

use crate::server_error::RelayError;

/// Errors that can occur in the server runtime.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, zero tick interval).
    ///
    /// Fatal: prevents startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket error. Fatal when binding, per-connection otherwise.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Peer sent bytes that are not a frame. Fatal for that connection only.
    #[error("protocol error: {0}")]
    Protocol(#[from] luckyones_proto::ProtocolError),

    /// Driver error. See [`RelayError`].
    #[error("driver error: {0}")]
    Driver(#[from] RelayError),
}
