//! The per-generation handle to the generation manager.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::UpgradeError;
use crate::fds::{FdName, InheritedFds};
use crate::net::{Listener, Network, Stream};
use crate::spawn::{spawn_successor, wait_ready};

/// Generation manager options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Where to write this generation's pid once it is ready.
    pub pid_file: Option<PathBuf>,
    /// How long a successor gets to declare readiness.
    pub upgrade_timeout: Duration,
    /// Executable started as the successor. Unset means the current
    /// executable with the current arguments.
    pub program: Option<PathBuf>,
    /// Arguments for `program`.
    pub args: Vec<OsString>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pid_file: None,
            upgrade_timeout: Duration::from_secs(60),
            program: None,
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Spawning,
    Upgraded,
    Stopped,
}

#[derive(Debug)]
struct Inner {
    options: Options,
    state: Mutex<State>,
    /// Descriptors from the parent not yet claimed by a server.
    inherited: Mutex<HashMap<FdName, OwnedFd>>,
    /// Write end of the parent's readiness pipe, until `ready()`.
    ready_pipe: Mutex<Option<OwnedFd>>,
    has_parent: bool,
    /// Duplicates of everything a successor should inherit.
    registered: Mutex<HashMap<FdName, OwnedFd>>,
    exit: CancellationToken,
}

/// Handle to the generation manager. Cheap to clone.
///
/// Listeners obtained through [`Upgrader::listen`] and connections registered
/// through [`Upgrader::register_conn`] are passed to the successor spawned by
/// [`Upgrader::upgrade`].
#[derive(Debug, Clone)]
pub struct Upgrader {
    inner: Arc<Inner>,
}

impl Upgrader {
    /// Create the handle for this generation, adopting whatever the parent
    /// announced in the environment.
    pub fn from_env(options: Options) -> Result<Self, UpgradeError> {
        Ok(Self::with_inherited(options, InheritedFds::from_env()?))
    }

    /// Create the handle for a cold start.
    pub fn new(options: Options) -> Self {
        Self::with_inherited(options, InheritedFds::default())
    }

    /// Create the handle from an explicit inheritance.
    pub fn with_inherited(options: Options, inherited: InheritedFds) -> Self {
        let (fds, ready) = inherited.into_parts();
        let has_parent = ready.is_some();
        if has_parent {
            info!(fd_count = fds.len(), "Started as successor of a running generation");
        }
        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(State::Idle),
                inherited: Mutex::new(fds),
                ready_pipe: Mutex::new(ready),
                has_parent,
                registered: Mutex::new(HashMap::new()),
                exit: CancellationToken::new(),
            }),
        }
    }

    /// Whether a parent generation is waiting for this one to become ready.
    pub fn has_parent(&self) -> bool {
        self.inner.has_parent
    }

    /// Duplicate every registered descriptor, as a successor would see them.
    pub fn snapshot(&self) -> io::Result<InheritedFds> {
        let registered = lock(&self.inner.registered);
        let mut snapshot = InheritedFds::default();
        for (name, fd) in registered.iter() {
            snapshot.insert(name.clone(), fd.try_clone()?);
        }
        Ok(snapshot)
    }

    /// Listen on an address, reusing the parent's socket when one was passed.
    pub async fn listen(&self, network: Network, addr: &str) -> io::Result<Listener> {
        let name = FdName::listener(network, addr);
        let inherited = lock(&self.inner.inherited).remove(&name);
        let listener = match inherited {
            Some(fd) => {
                info!(%network, addr, "Reusing inherited listener");
                Listener::from_owned_fd(network, fd)?
            }
            None => {
                let listener = Listener::bind(network, addr).await?;
                info!(%network, addr, "Bound fresh listener");
                listener
            }
        };
        let dup = listener.as_fd().try_clone_to_owned()?;
        lock(&self.inner.registered).insert(name, dup);
        Ok(listener)
    }

    /// Make a connection inheritable by a successor under `(network, id)`.
    pub fn register_conn(&self, network: Network, id: &str, conn: &Stream) -> io::Result<()> {
        let dup = conn.as_fd().try_clone_to_owned()?;
        lock(&self.inner.registered).insert(FdName::conn(network, id), dup);
        Ok(())
    }

    /// Forget a connection; its duplicate is closed.
    pub fn unregister_conn(&self, network: Network, id: &str) {
        lock(&self.inner.registered).remove(&FdName::conn(network, id));
    }

    /// Reacquire a connection registered under `(network, id)`.
    ///
    /// Connections inherited from the parent are preferred; otherwise a
    /// connection registered by this generation is handed back, which makes a
    /// transfer into the same process work. The registration is consumed
    /// either way; the caller registers the connection again.
    pub fn acquire_conn(&self, network: Network, id: &str) -> Result<Stream, UpgradeError> {
        let name = FdName::conn(network, id);
        let fd = lock(&self.inner.inherited)
            .remove(&name)
            .or_else(|| lock(&self.inner.registered).remove(&name))
            .ok_or_else(|| UpgradeError::UnknownConn {
                network,
                id: id.to_string(),
            })?;
        Ok(Stream::from_owned_fd(network, fd)?)
    }

    /// Declare this generation fully initialized.
    ///
    /// Writes the pid file, tells the parent (if any) to retire, and closes
    /// inherited descriptors nobody claimed. Only the pid file can fail this:
    /// a parent that cannot be told is logged and left to its own timeout.
    pub fn ready(&self) -> Result<(), UpgradeError> {
        if let Some(path) = &self.inner.options.pid_file {
            write_pid_file(path).map_err(|source| UpgradeError::PidFile {
                path: path.clone(),
                source,
            })?;
            debug!(path = %path.display(), "Wrote pid file");
        }

        if let Some(fd) = lock(&self.inner.ready_pipe).take() {
            let mut pipe = File::from(fd);
            match pipe.write_all(&[1]) {
                Ok(()) => info!("Signalled readiness to parent generation"),
                // The restored state lives here now, whatever became of the parent.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    warn!("Parent generation is gone, carrying on without it")
                }
                Err(e) => warn!(error = %e, "Failed to signal readiness to parent generation"),
            }
        }

        let unclaimed: Vec<FdName> = lock(&self.inner.inherited)
            .drain()
            .map(|(name, _)| name)
            .collect();
        if !unclaimed.is_empty() {
            warn!(
                count = unclaimed.len(),
                names = ?unclaimed,
                "Closing inherited fds that no server claimed"
            );
        }

        Ok(())
    }

    /// Token cancelled when this generation must exit.
    pub fn exit_token(&self) -> CancellationToken {
        self.inner.exit.clone()
    }

    /// Resolves when this generation must exit: its successor is ready, or
    /// [`Upgrader::stop`] was called.
    pub async fn exited(&self) {
        self.inner.exit.cancelled().await;
    }

    /// Spawn a successor and wait until it declares itself ready.
    ///
    /// Only one upgrade runs at a time; a concurrent call fails with
    /// [`UpgradeError::InProgress`]. On failure this generation carries on as
    /// if nothing happened.
    pub async fn upgrade(&self) -> Result<(), UpgradeError> {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                State::Idle => *state = State::Spawning,
                State::Spawning => return Err(UpgradeError::InProgress),
                State::Upgraded => return Err(UpgradeError::AlreadyUpgraded),
                State::Stopped => return Err(UpgradeError::Stopped),
            }
        }

        let result = self.spawn_and_wait().await;

        let mut state = lock(&self.inner.state);
        match &result {
            Ok(()) => {
                if *state == State::Spawning {
                    *state = State::Upgraded;
                }
                info!("Successor is ready, this generation will exit");
                self.inner.exit.cancel();
            }
            Err(e) => {
                if *state == State::Spawning {
                    *state = State::Idle;
                }
                error!(error = %e, "Upgrade failed, continuing with the current generation");
            }
        }
        result
    }

    async fn spawn_and_wait(&self) -> Result<(), UpgradeError> {
        let fds: Vec<(FdName, OwnedFd)> = {
            let registered = lock(&self.inner.registered);
            registered
                .iter()
                .map(|(name, fd)| Ok((name.clone(), fd.try_clone()?)))
                .collect::<io::Result<_>>()?
        };

        let options = &self.inner.options;
        let program = options
            .program
            .as_deref()
            .map(|exe| (exe, options.args.as_slice()));
        let successor = spawn_successor(&fds, program)?;
        drop(fds);
        info!(pid = successor.pid(), "Waiting for successor readiness");
        wait_ready(successor, options.upgrade_timeout).await
    }

    /// Request immediate termination of this generation.
    pub fn stop(&self) {
        *lock(&self.inner.state) = State::Stopped;
        self.inner.exit.cancel();
    }
}

fn write_pid_file(path: &Path) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, std::process::id().to_string())?;
    std::fs::rename(&tmp, path)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
