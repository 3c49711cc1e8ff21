//! File descriptor inheritance from the parent generation.
//!
//! Checks `LISTEN_FDS`, `MOLT_FD_NAMES` and `MOLT_READY_FD`. Fails hard if the
//! env says fds exist but they are invalid: a half-inherited state is a bug in
//! the parent process.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::UpgradeError;
use crate::net::Network;

pub(crate) const LISTEN_FDS: &str = "LISTEN_FDS";
pub(crate) const FD_NAMES: &str = "MOLT_FD_NAMES";
pub(crate) const READY_FD: &str = "MOLT_READY_FD";

/// First inherited descriptor; 0..2 are stdio.
pub(crate) const FIRST_FD: RawFd = 3;

/// Name under which a descriptor crosses a generation boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FdName {
    /// A listening socket, keyed by the address it was asked to listen on
    Listener {
        /// Socket family
        network: Network,
        /// Requested address (`host:port` or socket path)
        addr: String,
    },
    /// An accepted connection, keyed by the id its server gave it
    Conn {
        /// Socket family
        network: Network,
        /// Connection id
        id: String,
    },
}

impl FdName {
    /// Name of a listener.
    pub fn listener(network: Network, addr: impl Into<String>) -> Self {
        FdName::Listener {
            network,
            addr: addr.into(),
        }
    }

    /// Name of a connection.
    pub fn conn(network: Network, id: impl Into<String>) -> Self {
        FdName::Conn {
            network,
            id: id.into(),
        }
    }
}

impl fmt::Display for FdName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdName::Listener { network, addr } => write!(f, "listener {network}/{addr}"),
            FdName::Conn { network, id } => write!(f, "conn {network}/{id}"),
        }
    }
}

/// Descriptors handed over by a parent generation.
#[derive(Debug, Default)]
pub struct InheritedFds {
    fds: HashMap<FdName, OwnedFd>,
    ready: Option<OwnedFd>,
}

impl InheritedFds {
    /// Adopt the descriptors announced in the environment.
    ///
    /// Returns an empty set on a cold start (no `LISTEN_FDS`, or `0`).
    pub fn from_env() -> Result<Self, UpgradeError> {
        let count: usize = match std::env::var(LISTEN_FDS) {
            Ok(v) => v
                .parse()
                .map_err(|_| UpgradeError::Inherit(format!("{LISTEN_FDS} is not a number: {v}")))?,
            Err(_) => 0,
        };

        let mut inherited = Self::default();

        if let Ok(v) = std::env::var(READY_FD) {
            let fd: RawFd = v
                .parse()
                .map_err(|_| UpgradeError::Inherit(format!("{READY_FD} is not a number: {v}")))?;
            if !validate_fd(fd, libc::S_IFIFO) {
                return Err(UpgradeError::Inherit(format!(
                    "readiness fd {fd} is not a pipe"
                )));
            }
            inherited.ready = Some(adopt(fd)?);
        }

        if count == 0 {
            return Ok(inherited);
        }

        let names_raw = std::env::var(FD_NAMES).map_err(|_| {
            UpgradeError::Inherit(format!("{LISTEN_FDS} is set but {FD_NAMES} is missing"))
        })?;
        let names: Vec<FdName> = serde_json::from_str(&names_raw)
            .map_err(|e| UpgradeError::Inherit(format!("{FD_NAMES} is malformed: {e}")))?;

        if names.len() != count {
            return Err(UpgradeError::Inherit(format!(
                "{FD_NAMES} has {} entries but {LISTEN_FDS} says {count}",
                names.len()
            )));
        }

        for (i, name) in names.into_iter().enumerate() {
            let fd = FIRST_FD + i as RawFd;
            if !validate_fd(fd, libc::S_IFSOCK) {
                return Err(UpgradeError::Inherit(format!(
                    "inherited fd {fd} ({name}) is not a valid socket"
                )));
            }
            let owned = adopt(fd)?;
            info!(fd, name = %name, "Inherited fd from parent process");
            inherited.fds.insert(name, owned);
        }

        Ok(inherited)
    }

    /// Add a descriptor under a name, replacing any previous one.
    pub fn insert(&mut self, name: FdName, fd: OwnedFd) {
        self.fds.insert(name, fd);
    }

    /// Number of named descriptors.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// Whether no named descriptor was inherited.
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Names of the inherited descriptors.
    pub fn names(&self) -> impl Iterator<Item = &FdName> {
        self.fds.keys()
    }

    /// Attach the write end of a parent's readiness pipe.
    #[cfg(test)]
    pub(crate) fn with_ready(mut self, fd: OwnedFd) -> Self {
        self.ready = Some(fd);
        self
    }

    pub(crate) fn into_parts(self) -> (HashMap<FdName, OwnedFd>, Option<OwnedFd>) {
        (self.fds, self.ready)
    }
}

/// Validate that a file descriptor is open and of the given type using fstat.
pub(crate) fn validate_fd(fd: RawFd, kind: libc::mode_t) -> bool {
    if fd < 0 {
        return false;
    }
    // SAFETY: a zeroed stat is a valid out-parameter for fstat.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fstat only writes into `stat` and reports EBADF for closed fds.
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == kind
}

/// Set `FD_CLOEXEC` so the descriptor does not leak into later successors
/// unless it is explicitly passed again.
pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an fd we own; failures are reported through errno.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn adopt(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: the fd was validated as open, and the parent handed it to this
    // process only; nothing else in this process owns it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    set_cloexec(owned.as_raw_fd())?;
    Ok(owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cold start: no env vars → an empty set.
    #[test]
    fn test_cold_start_is_empty() {
        let inherited = InheritedFds::from_env().unwrap();
        assert!(inherited.is_empty());
        let (_, ready) = inherited.into_parts();
        assert!(ready.is_none());
    }

    /// Invalid fd is detected.
    #[test]
    fn test_invalid_fd_detection() {
        assert!(!validate_fd(9999, libc::S_IFSOCK));
        assert!(!validate_fd(-1, libc::S_IFSOCK));
    }

    #[test]
    fn test_socket_is_not_a_pipe() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        assert!(validate_fd(fd, libc::S_IFSOCK));
        assert!(!validate_fd(fd, libc::S_IFIFO));
    }

    #[test]
    fn test_fd_names_wire_shape() {
        let names = vec![
            FdName::listener(Network::Tcp, "127.0.0.1:9000"),
            FdName::conn(Network::Unix, "c-1"),
        ];
        let encoded = serde_json::to_string(&names).unwrap();
        assert_eq!(
            encoded,
            r#"[{"kind":"listener","network":"tcp","addr":"127.0.0.1:9000"},{"kind":"conn","network":"unix","id":"c-1"}]"#
        );
        let decoded: Vec<FdName> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, names);
    }

    #[test]
    fn test_adopt_sets_cloexec() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };

        let owned = adopt(fd).unwrap();
        let flags = unsafe { libc::fcntl(owned.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }
}
