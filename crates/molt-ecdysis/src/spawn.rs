//! Spawning a successor generation with descriptor passing.
//!
//! Unlike an exec-in-place restart, the current process stays alive: the
//! successor is a child that receives every registered fd in the range
//! `3..N`, plus the write end of a readiness pipe right after them.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::UpgradeError;
use crate::fds::{set_cloexec, FdName, FD_NAMES, FIRST_FD, LISTEN_FDS, READY_FD};

/// A spawned successor that has not yet declared readiness.
pub(crate) struct Successor {
    child: Child,
    ready: File,
}

impl Successor {
    pub(crate) fn pid(&self) -> u32 {
        self.child.id()
    }
}

/// Spawn a successor with the given descriptors.
///
/// `program` defaults to the current executable with the current arguments.
///
/// 1. Creates the readiness pipe
/// 2. Dups every source fd above the target range (safe against clobber)
/// 3. In the child, `dup2`s each staged fd to `3..N`, which clears `CLOEXEC`
/// 4. Announces names via `LISTEN_FDS` / `MOLT_FD_NAMES` / `MOLT_READY_FD`
pub(crate) fn spawn_successor(
    fds: &[(FdName, OwnedFd)],
    program: Option<(&Path, &[OsString])>,
) -> Result<Successor, UpgradeError> {
    let (exe, args): (PathBuf, Vec<OsString>) = match program {
        Some((exe, args)) => (exe.to_path_buf(), args.to_vec()),
        None => (std::env::current_exe()?, std::env::args_os().skip(1).collect()),
    };
    let names: Vec<&FdName> = fds.iter().map(|(name, _)| name).collect();
    let (ready_read, ready_write) = pipe()?;

    // Phase 1: dup all sources to fds above every target slot. If a source sits
    // at 4 and another fd must land on 4, a direct dup2 would destroy it.
    let total = fds.len() + 1;
    let base = FIRST_FD + total as RawFd;
    let mut staged: Vec<OwnedFd> = Vec::with_capacity(total);
    for fd in fds
        .iter()
        .map(|(_, fd)| fd.as_fd())
        .chain(std::iter::once(ready_write.as_fd()))
    {
        staged.push(dup_above(fd, base)?);
    }

    // Phase 2 runs in the child: dup2 from the staged fds into 3..N.
    let plan: Vec<(RawFd, RawFd)> = staged
        .iter()
        .enumerate()
        .map(|(i, fd)| (fd.as_raw_fd(), FIRST_FD + i as RawFd))
        .collect();
    let ready_fd = FIRST_FD + fds.len() as RawFd;

    let mut cmd = Command::new(&exe);
    cmd.args(&args)
        .env(LISTEN_FDS, fds.len().to_string())
        .env(FD_NAMES, serde_json::to_string(&names)?)
        .env(READY_FD, ready_fd.to_string());

    // SAFETY: the closure runs between fork and exec. It only calls dup2,
    // which is async-signal-safe, and reads the plan built before the fork.
    unsafe {
        cmd.pre_exec(move || {
            for &(src, dst) in &plan {
                if libc::dup2(src, dst) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    info!(
        exe = %exe.display(),
        fd_count = fds.len(),
        ready_fd,
        "Spawning successor generation"
    );

    let child = cmd.spawn()?;

    // The child holds its own copies now; the staged fds and the parent's write
    // end must go, or the readiness pipe never reports EOF.
    drop(staged);
    drop(ready_write);

    Ok(Successor {
        child,
        ready: File::from(ready_read),
    })
}

/// Wait for the successor's readiness byte.
///
/// A closed pipe without a byte means the successor died during startup. On
/// any failure the successor is killed and reaped.
pub(crate) async fn wait_ready(successor: Successor, timeout: Duration) -> Result<(), UpgradeError> {
    let Successor { child, mut ready } = successor;
    let pid = child.id();

    let read = tokio::task::spawn_blocking(move || {
        let mut byte = [0u8; 1];
        ready.read(&mut byte)
    });

    let result = match tokio::time::timeout(timeout, read).await {
        Ok(Ok(Ok(1))) => return Ok(()),
        Ok(Ok(Ok(_))) => Err(UpgradeError::SuccessorExited { pid }),
        Ok(Ok(Err(e))) => Err(UpgradeError::Io(e)),
        Ok(Err(join)) => Err(UpgradeError::Io(io::Error::other(join))),
        Err(_) => Err(UpgradeError::ReadyTimeout(timeout)),
    };

    warn!(pid, "Successor failed to become ready, killing it");
    reap(child).await;
    result
}

async fn reap(mut child: Child) {
    let pid = child.id();
    let reaped = tokio::task::spawn_blocking(move || {
        let _ = child.kill();
        child.wait()
    })
    .await;
    match reaped {
        Ok(Ok(status)) => info!(pid, %status, "Reaped failed successor"),
        Ok(Err(e)) => warn!(pid, error = %e, "Failed to reap successor"),
        Err(e) => warn!(pid, error = %e, "Reaper task failed"),
    }
}

pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    // SAFETY: `fds` is a valid two-element out-buffer.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe() succeeded, both descriptors are fresh and owned here.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(read.as_raw_fd())?;
    set_cloexec(write.as_raw_fd())?;
    Ok((read, write))
}

/// `F_DUPFD_CLOEXEC` gives a new fd >= `min` with `CLOEXEC` set.
fn dup_above(fd: BorrowedFd<'_>, min: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: fcntl on a borrowed, open descriptor.
    let dup = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, min) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl returned a fresh descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// F_DUPFD_CLOEXEC produces a high fd with CLOEXEC set.
    #[test]
    fn test_dup_above_range() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let high = dup_above(listener.as_fd(), 100).unwrap();
        assert!(high.as_raw_fd() >= 100);

        let flags = unsafe { libc::fcntl(high.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_pipe_is_cloexec_and_connected() {
        let (read, write) = pipe().unwrap();
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }

        let mut write = File::from(write);
        write.write_all(b"r").unwrap();
        drop(write);

        let mut read = File::from(read);
        let mut buf = Vec::new();
        read.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"r");
    }

    /// A successor that never writes the byte is reported as exited.
    #[tokio::test]
    async fn test_wait_ready_detects_early_exit() {
        let (read, write) = pipe().unwrap();
        let child = Command::new("true").spawn().unwrap();
        drop(write);

        let successor = Successor {
            child,
            ready: File::from(read),
        };
        let result = wait_ready(successor, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(UpgradeError::SuccessorExited { .. })));
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_and_kills() {
        let (read, write) = pipe().unwrap();
        let child = Command::new("sleep").arg("30").spawn().unwrap();

        let successor = Successor {
            child,
            ready: File::from(read),
        };
        let result = wait_ready(successor, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(UpgradeError::ReadyTimeout(_))));
        drop(write);
    }
}
