//! The contract a subsystem implements to take part in a generation handoff,
//! and the name-keyed registry the upgrade controller drives.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use molt_ecdysis::Upgrader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ServerError;

/// Per-server blobs keyed by server name, as exchanged between generations.
pub type TransferPayload = BTreeMap<String, String>;

/// A server whose live state can move to the next generation.
///
/// ## Lifecycle
///
/// ```text
/// run() ──► [restore(blob)] ──► ready ──► ... ──► transfer() ──► (exit)
/// ```
#[async_trait]
pub trait MigratableServer: Send + Sync + 'static {
    /// Stable, process-independent name; the join key in transfer payloads.
    fn name(&self) -> &str;

    /// Start accepting work. Returns once the server's tasks are spawned.
    async fn run(&self) -> Result<(), ServerError>;

    /// Stop accepting work and serialize what a successor needs.
    ///
    /// Must not return while this generation still exclusively holds a
    /// resource described by the returned blob. `None` means nothing to hand
    /// over.
    async fn transfer(&self) -> Option<String>;

    /// Resume state handed over by a predecessor.
    ///
    /// Called at most once, before readiness. Entries that cannot be decoded
    /// or reacquired are logged and skipped.
    async fn restore(&self, blob: &str);
}

/// What every server of one generation shares.
#[derive(Debug, Clone)]
pub struct ServerContext {
    /// Generation manager handle
    pub upgrader: Upgrader,
    /// Identity of this generation, shown to clients
    pub generation: u32,
    /// Cancelled when the generation exits
    pub shutdown: CancellationToken,
}

impl ServerContext {
    /// Create a context for the given generation.
    pub fn new(upgrader: Upgrader, generation: u32) -> Self {
        Self {
            upgrader,
            generation,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Servers of one generation, keyed by name.
///
/// Built once at startup. Every generation of the same binary registers the
/// same names, which is what lets payloads find their way back.
#[derive(Default)]
pub struct ServerRegistry {
    servers: BTreeMap<String, Arc<dyn MigratableServer>>,
}

impl fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("servers", &self.servers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server. Names must be unique.
    pub fn register(&mut self, server: Arc<dyn MigratableServer>) -> Result<(), ServerError> {
        let name = server.name().to_string();
        if self.servers.contains_key(&name) {
            return Err(ServerError::DuplicateName(name));
        }
        debug!(server = %name, "Registered migratable server");
        self.servers.insert(name, server);
        Ok(())
    }

    /// Look up a server by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn MigratableServer>> {
        self.servers.get(name)
    }

    /// Registered names, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether no server is registered.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Start every server, stopping at the first failure.
    pub async fn run_all(&self) -> Result<(), ServerError> {
        for (name, server) in &self.servers {
            server.run().await?;
            info!(server = %name, "Server running");
        }
        Ok(())
    }

    /// Drain every server and collect their blobs.
    pub async fn transfer_all(&self) -> TransferPayload {
        let mut payload = TransferPayload::new();
        for (name, server) in &self.servers {
            match server.transfer().await {
                Some(blob) => {
                    debug!(server = %name, bytes = blob.len(), "Server transferred");
                    payload.insert(name.clone(), blob);
                }
                None => debug!(server = %name, "Server had nothing to transfer"),
            }
        }
        payload
    }

    /// Hand each blob to the server of the same name.
    pub async fn restore_all(&self, payload: TransferPayload) {
        for (name, blob) in payload {
            match self.servers.get(&name) {
                Some(server) => {
                    info!(server = %name, "Restoring server state");
                    server.restore(&blob).await;
                }
                None => warn!(server = %name, "Transfer payload names an unknown server, skipping"),
            }
        }
    }
}
