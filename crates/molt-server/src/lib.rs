//! molt: zero-downtime generation handoff for connection-holding servers.
//!
//! A generation is one process. On `SIGHUP` it spawns its successor with its
//! listening and connected sockets; the successor finds it over a loopback
//! control plane, asks every [`MigratableServer`] to hand over its state, and
//! only then declares itself ready, at which point the old generation exits.
//!
//! ## Pieces
//!
//! - [`migratable`]: the server contract and the name-keyed registry
//! - [`echo`]: a line echo server whose connections survive a handoff
//! - [`transfer`]: the control plane (`POST /hello`, `POST /transfer`)
//! - [`upgrade`]: the per-generation state machine
//!
//! Socket inheritance itself lives in `molt-ecdysis`.

pub mod config;
pub mod echo;
pub mod error;
pub mod migratable;
pub mod telemetry;
pub mod transfer;
pub mod upgrade;

pub use config::UpgradeConfig;
pub use echo::{EchoOptions, EchoServer};
pub use error::{ControllerError, HandshakeError, ServerError};
pub use migratable::{MigratableServer, ServerContext, ServerRegistry, TransferPayload};
pub use transfer::{ControlClient, ControlServer};
pub use upgrade::{Phase, ReloadHandle, Upgrade};
