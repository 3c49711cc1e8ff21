//! Upgrade controller: the life of one generation.
//!
//! ```text
//! Init → ServersStarting → ParentProbe → {RestoringFromParent | NoParent}
//!      → Ready → Running → {UpgradeRequested → SpawningSuccessor → Running}
//!                        | {StopRequested → Exited}
//! ```
//!
//! `SIGHUP` spawns a successor, which drains this generation through the
//! control plane before it declares readiness. `SIGTERM` stops without any
//! drain: open connections are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::UpgradeConfig;
use crate::error::{ControllerError, HandshakeError};
use crate::migratable::{ServerContext, ServerRegistry};
use crate::transfer::{ControlClient, ControlServer};

const CONTROL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Phase of the upgrade controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    ServersStarting,
    ParentProbe,
    RestoringFromParent,
    NoParent,
    Ready,
    Running,
    UpgradeRequested,
    SpawningSuccessor,
    StopRequested,
    Exited,
}

/// Asks a running controller to upgrade, exactly like `SIGHUP`.
#[derive(Debug, Clone)]
pub struct ReloadHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ReloadHandle {
    /// Request an upgrade. Returns `false` once the controller is gone.
    pub fn reload(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

/// Per-generation state machine.
#[derive(Debug)]
pub struct Upgrade {
    config: UpgradeConfig,
    ctx: ServerContext,
    registry: Arc<ServerRegistry>,
    phase: Arc<watch::Sender<Phase>>,
    reload_tx: mpsc::UnboundedSender<()>,
    reload_rx: Option<mpsc::UnboundedReceiver<()>>,
}

impl Upgrade {
    /// Create the controller for one generation.
    pub fn new(config: UpgradeConfig, ctx: ServerContext, registry: ServerRegistry) -> Self {
        let (phase, _) = watch::channel(Phase::Init);
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        Self {
            config,
            ctx,
            registry: Arc::new(registry),
            phase: Arc::new(phase),
            reload_tx,
            reload_rx: Some(reload_rx),
        }
    }

    /// Handle that requests upgrades without a signal.
    pub fn reload_handle(&self) -> ReloadHandle {
        ReloadHandle {
            tx: self.reload_tx.clone(),
        }
    }

    /// Subscribe to phase changes.
    pub fn phases(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn publish(&self, phase: Phase) {
        publish(&self.phase, self.ctx.generation, phase);
    }

    /// Run the generation until it must exit.
    ///
    /// Fails only during startup: a server that cannot listen, signal
    /// handlers that cannot be installed, or readiness that cannot be
    /// declared.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        let mut reloads = self.reload_rx.take();

        info!(
            generation = self.ctx.generation,
            servers = self.registry.len(),
            inherited = self.ctx.upgrader.has_parent(),
            "Starting generation"
        );

        self.publish(Phase::ServersStarting);
        if let Err(e) = self.registry.run_all().await {
            error!(generation = self.ctx.generation, error = %e, "Server failed to start");
            self.exit(None).await;
            return Err(e.into());
        }

        self.publish(Phase::ParentProbe);
        let control = self.bind_control().await;
        self.handshake().await;

        let (mut sighup, mut sigterm) = match self.declare_ready() {
            Ok(signals) => signals,
            Err(e) => {
                error!(generation = self.ctx.generation, error = %e, "Failed to become ready");
                self.exit(control.as_deref()).await;
                return Err(e);
            }
        };

        self.publish(Phase::Running);
        self.watch_signals(&mut sighup, &mut sigterm, &mut reloads, control.clone())
            .await;

        self.exit(control.as_deref()).await;
        Ok(())
    }

    async fn bind_control(&self) -> Option<Arc<ControlServer>> {
        match ControlServer::bind(
            self.config.control_addr,
            self.ctx.generation,
            Arc::clone(&self.registry),
        )
        .await
        {
            Ok(control) => Some(Arc::new(control)),
            Err(e) => {
                error!(
                    addr = %self.config.control_addr,
                    error = %e,
                    "Failed to bind control server, a successor cannot drain this generation"
                );
                None
            }
        }
    }

    /// Find a predecessor and take over its servers' state.
    async fn handshake(&self) {
        let generation = self.ctx.generation;
        let client = match ControlClient::from_config(&self.config, generation) {
            Ok(client) => client,
            Err(e) => {
                error!(generation, error = %e, "Failed to build control client");
                self.publish(Phase::NoParent);
                return;
            }
        };

        match client.probe().await {
            Ok(hello) => debug!(generation, predecessor = ?hello.generation, "Predecessor found"),
            Err(HandshakeError::Unavailable { addr }) => {
                info!(generation, %addr, "No predecessor answered, starting fresh");
                self.publish(Phase::NoParent);
                return;
            }
            Err(e) => {
                warn!(generation, error = %e, "Probe failed, starting fresh");
                self.publish(Phase::NoParent);
                return;
            }
        }

        self.publish(Phase::RestoringFromParent);
        match client.fetch_transfer().await {
            Ok(payload) => self.registry.restore_all(payload).await,
            Err(e) => error!(
                generation,
                error = %e,
                "Failed to fetch predecessor state, its connections are lost"
            ),
        }
    }

    /// Install signal handlers, then tell the generation manager we are ready.
    ///
    /// Handlers go first: once the pid file exists a `SIGHUP` may arrive, and
    /// its default action would kill the process.
    fn declare_ready(&self) -> Result<(Signal, Signal), ControllerError> {
        let sighup = signal(SignalKind::hangup()).map_err(ControllerError::Signals)?;
        let sigterm = signal(SignalKind::terminate()).map_err(ControllerError::Signals)?;

        self.publish(Phase::Ready);
        self.ctx.upgrader.ready()?;
        Ok((sighup, sigterm))
    }

    async fn watch_signals(
        &self,
        sighup: &mut Signal,
        sigterm: &mut Signal,
        reloads: &mut Option<mpsc::UnboundedReceiver<()>>,
        control: Option<Arc<ControlServer>>,
    ) {
        let generation = self.ctx.generation;
        let exit = self.ctx.upgrader.exit_token();
        let upgrading = Arc::new(AtomicBool::new(false));

        loop {
            tokio::select! {
                _ = exit.cancelled() => {
                    info!(generation, "Generation manager requested exit");
                    return;
                }
                Some(()) = sighup.recv() => {
                    info!(generation, "Received SIGHUP, upgrading");
                    self.request_upgrade(&upgrading, control.clone());
                }
                Some(()) = next_reload(reloads) => {
                    info!(generation, "Reload requested, upgrading");
                    self.request_upgrade(&upgrading, control.clone());
                }
                Some(()) = sigterm.recv() => {
                    info!(generation, "Received SIGTERM, stopping without drain");
                    self.publish(Phase::StopRequested);
                    self.ctx.upgrader.stop();
                }
            }
        }
    }

    fn request_upgrade(&self, upgrading: &Arc<AtomicBool>, control: Option<Arc<ControlServer>>) {
        let generation = self.ctx.generation;
        if upgrading.swap(true, Ordering::SeqCst) {
            warn!(generation, "Upgrade already in progress, ignoring reload");
            return;
        }
        self.publish(Phase::UpgradeRequested);

        // A payload left over from an earlier attempt must not be restored twice.
        if let Some(control) = &control {
            control.take_handout();
        }

        let upgrader = self.ctx.upgrader.clone();
        let registry = Arc::clone(&self.registry);
        let phase = Arc::clone(&self.phase);
        let upgrading = Arc::clone(upgrading);
        tokio::spawn(async move {
            publish(&phase, generation, Phase::SpawningSuccessor);
            match upgrader.upgrade().await {
                Ok(()) => info!(generation, "Successor took over"),
                Err(e) => {
                    error!(generation, error = %e, "Upgrade failed, carrying on");
                    let handout = control.as_ref().and_then(|c| c.take_handout());
                    if let Some(payload) = handout {
                        warn!(
                            generation,
                            servers = payload.len(),
                            "Failed successor had drained this generation, taking the state back"
                        );
                        registry.restore_all(payload).await;
                    }
                    publish(&phase, generation, Phase::Running);
                }
            }
            upgrading.store(false, Ordering::SeqCst);
        });
    }

    async fn exit(&self, control: Option<&ControlServer>) {
        if let Some(control) = control {
            control.shutdown(CONTROL_SHUTDOWN_GRACE).await;
        }
        self.ctx.shutdown.cancel();
        self.publish(Phase::Exited);
    }
}

async fn next_reload(reloads: &mut Option<mpsc::UnboundedReceiver<()>>) -> Option<()> {
    match reloads {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn publish(tx: &watch::Sender<Phase>, generation: u32, phase: Phase) {
    let changed = tx.send_if_modified(|current| {
        if *current == Phase::Exited || *current == phase {
            return false;
        }
        *current = phase;
        true
    });
    if changed {
        info!(generation, ?phase, "Phase changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    use molt_ecdysis::{Options, Upgrader};

    use crate::migratable::tests::FakeServer;

    fn unused_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn config(control_addr: SocketAddr) -> UpgradeConfig {
        UpgradeConfig {
            control_addr,
            probe_timeout: Duration::from_millis(500),
            transfer_timeout: Duration::from_secs(5),
            handshake_attempts: 32,
            ..UpgradeConfig::default()
        }
    }

    struct Generation {
        upgrader: Upgrader,
        server: Arc<FakeServer>,
        reload: ReloadHandle,
        phases: watch::Receiver<Phase>,
        task: tokio::task::JoinHandle<Result<(), ControllerError>>,
    }

    fn start(id: u32, control_addr: SocketAddr, blob: Option<&str>) -> Generation {
        start_with(id, control_addr, blob, Options::default())
    }

    fn start_with(
        id: u32,
        control_addr: SocketAddr,
        blob: Option<&str>,
        options: Options,
    ) -> Generation {
        let upgrader = Upgrader::new(options);
        let server = Arc::new(FakeServer::new("fake", blob));
        let mut registry = ServerRegistry::new();
        registry.register(server.clone()).unwrap();

        let ctx = ServerContext::new(upgrader.clone(), id);
        let controller = Upgrade::new(config(control_addr), ctx, registry);
        assert_eq!(controller.phase(), Phase::Init);
        let phases = controller.phases();
        let reload = controller.reload_handle();
        let task = tokio::spawn(controller.run());
        Generation {
            upgrader,
            server,
            reload,
            phases,
            task,
        }
    }

    async fn wait_for(phases: &mut watch::Receiver<Phase>, phase: Phase) {
        tokio::time::timeout(Duration::from_secs(10), phases.wait_for(|p| *p == phase))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_lone_generation_reaches_running_without_restore() {
        let mut gen = start(1, unused_addr(), Some("state"));
        wait_for(&mut gen.phases, Phase::Running).await;

        assert_eq!(*gen.server.runs.lock().unwrap(), 1);
        assert!(gen.server.restored.lock().unwrap().is_empty());

        gen.upgrader.stop();
        gen.task.await.unwrap().unwrap();
        assert_eq!(*gen.phases.borrow(), Phase::Exited);
    }

    #[tokio::test]
    async fn test_successor_restores_predecessor_state() {
        let addr = unused_addr();
        let mut old = start(1, addr, Some("from-gen-1"));
        wait_for(&mut old.phases, Phase::Running).await;

        let mut new = start(2, addr, None);
        wait_for(&mut new.phases, Phase::Running).await;

        assert_eq!(
            *new.server.restored.lock().unwrap(),
            vec!["from-gen-1".to_string()]
        );
        assert!(old.server.restored.lock().unwrap().is_empty());

        old.upgrader.stop();
        new.upgrader.stop();
        old.task.await.unwrap().unwrap();
        new.task.await.unwrap().unwrap();
    }

    /// A successor that drains the generation and then dies leaves the
    /// state with nobody, so the generation takes it back. A reload arriving
    /// while the first attempt waits is ignored and cannot discard it.
    #[tokio::test]
    async fn test_failed_upgrade_takes_state_back() {
        let addr = unused_addr();
        // `sleep` never signals readiness and exits after two seconds.
        let options = Options {
            upgrade_timeout: Duration::from_secs(10),
            program: Some(PathBuf::from("sleep")),
            args: vec![OsString::from("2")],
            ..Options::default()
        };
        let mut gen = start_with(1, addr, Some("state-1"), options);
        wait_for(&mut gen.phases, Phase::Running).await;

        assert!(gen.reload.reload());
        wait_for(&mut gen.phases, Phase::SpawningSuccessor).await;

        // Drain the generation the way its successor would.
        let client = ControlClient::new(addr, 2).unwrap().with_attempts(32);
        let payload = client.fetch_transfer().await.unwrap();
        assert_eq!(payload.get("fake").map(String::as_str), Some("state-1"));

        assert!(gen.reload.reload());

        wait_for(&mut gen.phases, Phase::Running).await;
        assert_eq!(
            *gen.server.restored.lock().unwrap(),
            vec!["state-1".to_string()]
        );
        assert!(!gen.upgrader.exit_token().is_cancelled());

        gen.upgrader.stop();
        gen.task.await.unwrap().unwrap();
        assert_eq!(*gen.phases.borrow(), Phase::Exited);
    }

    #[test]
    fn test_no_phase_after_exit() {
        let (tx, rx) = watch::channel(Phase::Running);
        publish(&tx, 1, Phase::Exited);
        publish(&tx, 1, Phase::Running);
        assert_eq!(*rx.borrow(), Phase::Exited);
    }
}
