//! Error types for the generation manager.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::net::Network;

/// Generation manager errors.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// IO error (sockets, pipes, process spawn)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The inheritance announced by the parent is inconsistent
    #[error("Invalid fd inheritance: {0}")]
    Inherit(String),

    /// Fd names could not be encoded for the successor
    #[error("Failed to encode fd names: {0}")]
    Names(#[from] serde_json::Error),

    /// Network name is neither `tcp` nor `unix`
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),

    /// No inherited or registered connection carries this id
    #[error("No connection {network}/{id} to acquire")]
    UnknownConn {
        /// Network the connection was registered under
        network: Network,
        /// Connection id
        id: String,
    },

    /// A successor is already being spawned
    #[error("An upgrade is already in progress")]
    InProgress,

    /// A successor already took over from this generation
    #[error("This generation has already been upgraded")]
    AlreadyUpgraded,

    /// `stop()` was called
    #[error("This generation is stopping")]
    Stopped,

    /// The successor closed the readiness pipe without signalling
    #[error("Successor {pid} exited before becoming ready")]
    SuccessorExited {
        /// Successor process id
        pid: u32,
    },

    /// The successor did not signal readiness in time
    #[error("Successor did not become ready within {0:?}")]
    ReadyTimeout(Duration),

    /// Writing the pid file failed
    #[error("Failed to write pid file {}: {source}", path.display())]
    PidFile {
        /// Pid file path
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },
}
