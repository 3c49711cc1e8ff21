//! Error types for servers, the control plane and the upgrade controller.

use std::io;
use std::net::SocketAddr;

use molt_ecdysis::{Network, UpgradeError};
use thiserror::Error;

/// Migratable server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The server could not bind its address; fatal at startup
    #[error("Failed to listen on {network}/{addr}: {source}")]
    Listen {
        /// Socket family
        network: Network,
        /// Requested address
        addr: String,
        /// Underlying error
        source: io::Error,
    },

    /// `run()` was called twice
    #[error("Server {0} is already running")]
    AlreadyRunning(String),

    /// Two servers share a name in one registry
    #[error("Duplicate server name: {0}")]
    DuplicateName(String),
}

/// Control-plane handshake errors.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// No other generation answered the probe; the normal first-start path
    #[error("No predecessor answered on {addr}")]
    Unavailable {
        /// Control-plane address probed
        addr: SocketAddr,
    },

    /// The transfer call failed after a successful probe; predecessor state is lost
    #[error("Transfer fetch failed: {0}")]
    Fetch(String),

    /// The HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Errors that abort a generation.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A server failed to start
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The generation manager failed (readiness, pid file)
    #[error(transparent)]
    Upgrade(#[from] UpgradeError),

    /// Signal handlers could not be installed
    #[error("Failed to install signal handlers: {0}")]
    Signals(io::Error),
}
