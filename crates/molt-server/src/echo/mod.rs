//! Line echo server whose connections survive a generation handoff.
//!
//! Each line a client sends is answered with `[<generation>]echo <line>`, so
//! a client can see which generation served it. On `transfer()` every
//! connection task stops at a line boundary and parks its unanswered bytes;
//! the successor reacquires the sockets through the generation manager and
//! answers those bytes first.
//!
//! ## Transfer blob
//!
//! ```json
//! {"Conns": {"<id>": {"Pending": "<base64>"}}}
//! ```

mod connection;
mod drain;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use molt_ecdysis::{Listener, Network, Stream};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::UpgradeConfig;
use crate::error::ServerError;
use crate::migratable::{MigratableServer, ServerContext};

use connection::Connection;
use drain::{DrainGuard, DrainTracker};

/// Default registry name of the echo server.
pub const DEFAULT_NAME: &str = "echo";

/// Echo server settings.
#[derive(Debug, Clone)]
pub struct EchoOptions {
    /// Registry name
    pub name: String,
    /// Socket family
    pub network: Network,
    /// `host:port` or socket path
    pub addr: String,
    /// Bound on each read; cancellation is noticed within one interval
    pub read_poll: Duration,
    /// Bound on each reply write
    pub write_timeout: Duration,
}

impl EchoOptions {
    /// Options for `(network, addr)` with default name and timings.
    pub fn new(network: Network, addr: impl Into<String>) -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            network,
            addr: addr.into(),
            read_poll: Duration::from_millis(10),
            write_timeout: Duration::from_secs(5),
        }
    }

    /// Options taken from the generation configuration.
    pub fn from_config(config: &UpgradeConfig) -> Self {
        Self {
            read_poll: config.read_poll,
            write_timeout: config.write_timeout,
            ..Self::new(config.echo_network, config.echo_addr.clone())
        }
    }

    /// Use another registry name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EchoBlob {
    #[serde(default)]
    conns: BTreeMap<String, ConnBlob>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConnBlob {
    #[serde(default)]
    pending: String,
}

/// Registry entry of one live connection.
#[derive(Debug, Default)]
struct ConnRecord {
    /// Unanswered bytes, filled in when the connection is parked
    pending: Vec<u8>,
}

struct Inner {
    name: String,
    network: Network,
    addr: String,
    generation: u32,
    read_poll: Duration,
    write_timeout: Duration,
    ctx: ServerContext,
    running: AtomicBool,
    local_addr: Mutex<Option<String>>,
    conns: Mutex<HashMap<String, ConnRecord>>,
    /// Set before the listener closes; read by connection tasks on cancel.
    transferring: AtomicBool,
    /// Listener set aside by a stopped accept loop.
    parked_listener: Mutex<Option<Listener>>,
    stop_accepting: Mutex<CancellationToken>,
    /// Fired to stop connection tasks; replaced when a restore re-arms.
    conn_cancel: Mutex<CancellationToken>,
    drain: DrainTracker,
    transfer_lock: tokio::sync::Mutex<()>,
}

/// Connection-oriented echo server.
pub struct EchoServer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EchoServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoServer")
            .field("name", &self.inner.name)
            .field("network", &self.inner.network)
            .field("addr", &self.inner.addr)
            .field("generation", &self.inner.generation)
            .finish()
    }
}

impl EchoServer {
    /// Create a server; nothing is bound until [`MigratableServer::run`].
    pub fn new(ctx: ServerContext, options: EchoOptions) -> Self {
        let stop_accepting = ctx.shutdown.child_token();
        let conn_cancel = ctx.shutdown.child_token();
        Self {
            inner: Arc::new(Inner {
                name: options.name,
                network: options.network,
                addr: options.addr,
                generation: ctx.generation,
                read_poll: options.read_poll,
                write_timeout: options.write_timeout,
                ctx,
                running: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                conns: Mutex::new(HashMap::new()),
                transferring: AtomicBool::new(false),
                parked_listener: Mutex::new(None),
                stop_accepting: Mutex::new(stop_accepting),
                conn_cancel: Mutex::new(conn_cancel),
                drain: DrainTracker::new(),
                transfer_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Generation id used in replies.
    pub fn generation(&self) -> u32 {
        self.inner.generation
    }

    /// Address actually bound, once running.
    pub fn local_addr(&self) -> Option<String> {
        lock(&self.inner.local_addr).clone()
    }

    /// Ids of the live connections, sorted.
    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.conns).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.conns).len()
    }
}

#[async_trait]
impl MigratableServer for EchoServer {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn run(&self) -> Result<(), ServerError> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning(inner.name.clone()));
        }

        let listener = match inner.ctx.upgrader.listen(inner.network, &inner.addr).await {
            Ok(listener) => listener,
            Err(source) => {
                inner.running.store(false, Ordering::SeqCst);
                return Err(ServerError::Listen {
                    network: inner.network,
                    addr: inner.addr.clone(),
                    source,
                });
            }
        };

        let bound = listener.local_addr().unwrap_or_else(|_| inner.addr.clone());
        info!(
            server = %inner.name,
            network = %inner.network,
            addr = %bound,
            generation = inner.generation,
            "Echo server listening"
        );
        *lock(&inner.local_addr) = Some(bound);

        inner.start_accepting(listener);
        Ok(())
    }

    async fn transfer(&self) -> Option<String> {
        let inner = &self.inner;
        let _serialized = inner.transfer_lock.lock().await;

        inner.transferring.store(true, Ordering::SeqCst);
        lock(&inner.stop_accepting).cancel();
        inner.conn_cancel().cancel();

        debug!(server = %inner.name, active = inner.drain.active(), "Waiting for tasks to settle");
        inner.drain.drained().await;

        let conns: BTreeMap<String, ConnBlob> = lock(&inner.conns)
            .drain()
            .map(|(id, record)| {
                let pending = BASE64.encode(&record.pending);
                (id, ConnBlob { pending })
            })
            .collect();
        let count = conns.len();

        match serde_json::to_string(&EchoBlob { conns }) {
            Ok(blob) => {
                info!(server = %inner.name, connections = count, "Echo server transferred");
                Some(blob)
            }
            Err(e) => {
                error!(server = %inner.name, error = %e, "Failed to serialize connections");
                None
            }
        }
    }

    async fn restore(&self, blob: &str) {
        let inner = &self.inner;
        if blob.trim().is_empty() {
            debug!(server = %inner.name, "Empty transfer blob, nothing to restore");
            return;
        }

        let parsed: EchoBlob = match serde_json::from_str(blob) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(server = %inner.name, error = %e, "Malformed transfer blob, ignoring");
                return;
            }
        };

        inner.rearm();

        let offered = parsed.conns.len();
        let mut restored = 0usize;
        for (id, entry) in parsed.conns {
            let pending = match BASE64.decode(entry.pending.as_bytes()) {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(conn_id = %id, error = %e, "Undecodable pending bytes, skipping connection");
                    continue;
                }
            };

            if lock(&inner.conns).contains_key(&id) {
                warn!(conn_id = %id, "Connection id already live, skipping");
                continue;
            }

            let stream = match inner.ctx.upgrader.acquire_conn(inner.network, &id) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(conn_id = %id, error = %e, "Failed to reacquire connection, skipping");
                    continue;
                }
            };

            if inner.admit(id, stream, pending) {
                restored += 1;
            }
        }

        info!(server = %inner.name, offered, restored, "Echo server restored connections");
    }
}

impl Inner {
    fn conn_cancel(&self) -> CancellationToken {
        lock(&self.conn_cancel).clone()
    }

    fn start_accepting(self: &Arc<Self>, listener: Listener) {
        let stop = lock(&self.stop_accepting).clone();
        let guard = self.drain.guard();
        tokio::spawn(accept_loop(Arc::clone(self), listener, stop, guard));
    }

    /// Resume service after this server's own transfer was handed back.
    fn rearm(self: &Arc<Self>) {
        if !self.transferring.swap(false, Ordering::SeqCst) {
            return;
        }
        *lock(&self.conn_cancel) = self.ctx.shutdown.child_token();
        *lock(&self.stop_accepting) = self.ctx.shutdown.child_token();
        let parked = lock(&self.parked_listener).take();
        if let Some(listener) = parked {
            self.start_accepting(listener);
        }
        debug!(server = %self.name, "Re-armed after transfer");
    }

    /// Register a connection and spawn its task. Returns false if it was dropped.
    fn admit(self: &Arc<Self>, id: String, stream: Stream, pending: Vec<u8>) -> bool {
        if let Err(e) = self.ctx.upgrader.register_conn(self.network, &id, &stream) {
            warn!(conn_id = %id, error = %e, "Failed to register connection, dropping it");
            return false;
        }
        lock(&self.conns).insert(id.clone(), ConnRecord::default());

        let guard = self.drain.guard();
        let cancel = self.conn_cancel();
        debug!(conn_id = %id, pending = pending.len(), "Connection admitted");
        tokio::spawn(connection::serve(
            Arc::clone(self),
            Connection {
                id,
                stream,
                pending,
            },
            cancel,
            guard,
        ));
        true
    }

    /// Leave the record for `transfer()` to hand off.
    fn park(&self, id: &str, pending: Vec<u8>) {
        if let Some(record) = lock(&self.conns).get_mut(id) {
            record.pending = pending;
        }
    }

    /// Forget a connection for good.
    fn close(&self, id: &str) {
        lock(&self.conns).remove(id);
        self.ctx.upgrader.unregister_conn(self.network, id);
    }
}

async fn accept_loop(
    inner: Arc<Inner>,
    listener: Listener,
    stop: CancellationToken,
    _guard: DrainGuard,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!(server = %inner.name, "Accept loop stopped");
                *lock(&inner.parked_listener) = Some(listener);
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let id = Uuid::new_v4().to_string();
                    inner.admit(id, stream, Vec::new());
                }
                Err(e) => {
                    warn!(server = %inner.name, error = %e, "Accept failed");
                    tokio::time::sleep(inner.read_poll).await;
                }
            },
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
