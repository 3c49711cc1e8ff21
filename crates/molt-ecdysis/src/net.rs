//! Stream transports that can be handed across a re-exec.
//!
//! Both TCP and Unix domain sockets are supported. The enums here only
//! dispatch; the descriptors underneath are what the generation manager
//! duplicates and passes on.

use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::debug;

use crate::error::UpgradeError;

/// Socket family of a listener or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// TCP over IPv4 or IPv6
    Tcp,
    /// Unix domain stream socket
    Unix,
}

impl Network {
    /// Wire name of the network.
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(UpgradeError::UnknownNetwork(other.to_string())),
        }
    }
}

/// A listening socket.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener
    Tcp(TcpListener),
    /// Unix domain listener
    Unix(UnixListener),
}

impl Listener {
    /// Bind a fresh listener.
    ///
    /// For Unix sockets a stale socket file at `addr` is removed first. A
    /// path that is not a socket, or a socket somebody still listens on, fails
    /// with `AddrInUse`.
    pub async fn bind(network: Network, addr: &str) -> io::Result<Self> {
        match network {
            Network::Tcp => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
            Network::Unix => {
                remove_stale_socket(addr).await?;
                Ok(Listener::Unix(UnixListener::bind(addr)?))
            }
        }
    }

    /// Adopt an already listening descriptor.
    pub(crate) fn from_owned_fd(network: Network, fd: OwnedFd) -> io::Result<Self> {
        match network {
            Network::Tcp => {
                let std = std::net::TcpListener::from(fd);
                std.set_nonblocking(true)?;
                Ok(Listener::Tcp(TcpListener::from_std(std)?))
            }
            Network::Unix => {
                let std = std::os::unix::net::UnixListener::from(fd);
                std.set_nonblocking(true)?;
                Ok(Listener::Unix(UnixListener::from_std(std)?))
            }
        }
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> io::Result<Stream> {
        match self {
            Listener::Tcp(l) => l.accept().await.map(|(s, _)| Stream::Tcp(s)),
            Listener::Unix(l) => l.accept().await.map(|(s, _)| Stream::Unix(s)),
        }
    }

    /// Network of this listener.
    pub fn network(&self) -> Network {
        match self {
            Listener::Tcp(_) => Network::Tcp,
            Listener::Unix(_) => Network::Unix,
        }
    }

    /// Bound address, as a `host:port` or a socket path.
    pub fn local_addr(&self) -> io::Result<String> {
        match self {
            Listener::Tcp(l) => Ok(l.local_addr()?.to_string()),
            Listener::Unix(l) => Ok(l
                .local_addr()?
                .as_pathname()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
        }
    }
}

async fn remove_stale_socket(path: &str) -> io::Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{path} exists and is not a socket"),
        ));
    }
    match UnixStream::connect(path).await {
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{path} is served by a live listener"),
        )),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            std::fs::remove_file(path)?;
            debug!(path, "Removed stale unix socket");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(l) => l.as_fd(),
            Listener::Unix(l) => l.as_fd(),
        }
    }
}

/// A connected stream.
#[derive(Debug)]
pub enum Stream {
    /// TCP stream
    Tcp(TcpStream),
    /// Unix domain stream
    Unix(UnixStream),
}

impl Stream {
    /// Connect to a listener.
    pub async fn connect(network: Network, addr: &str) -> io::Result<Self> {
        match network {
            Network::Tcp => Ok(Stream::Tcp(TcpStream::connect(addr).await?)),
            Network::Unix => Ok(Stream::Unix(UnixStream::connect(addr).await?)),
        }
    }

    /// Adopt an already connected descriptor.
    pub(crate) fn from_owned_fd(network: Network, fd: OwnedFd) -> io::Result<Self> {
        match network {
            Network::Tcp => {
                let std = std::net::TcpStream::from(fd);
                std.set_nonblocking(true)?;
                Ok(Stream::Tcp(TcpStream::from_std(std)?))
            }
            Network::Unix => {
                let std = std::os::unix::net::UnixStream::from(fd);
                std.set_nonblocking(true)?;
                Ok(Stream::Unix(UnixStream::from_std(std)?))
            }
        }
    }

    /// Network of this stream.
    pub fn network(&self) -> Network {
        match self {
            Stream::Tcp(_) => Network::Tcp,
            Stream::Unix(_) => Network::Unix,
        }
    }
}

impl AsFd for Stream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Stream::Tcp(s) => s.as_fd(),
            Stream::Unix(s) => s.as_fd(),
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_network_parse() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("TCP6".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("unix".parse::<Network>().unwrap(), Network::Unix);
        assert!(matches!(
            "udp".parse::<Network>(),
            Err(UpgradeError::UnknownNetwork(n)) if n == "udp"
        ));
    }

    #[tokio::test]
    async fn test_unix_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let path = path.to_str().unwrap();

        let first = Listener::bind(Network::Unix, path).await.unwrap();
        drop(first);
        // The socket file outlives the listener; a second bind must not fail.
        let second = Listener::bind(Network::Unix, path).await.unwrap();
        assert_eq!(second.local_addr().unwrap(), path);
    }

    #[tokio::test]
    async fn test_unix_bind_keeps_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        std::fs::write(&path, b"data").unwrap();

        let err = Listener::bind(Network::Unix, path.to_str().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_unix_bind_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let path = path.to_str().unwrap();

        let live = Listener::bind(Network::Unix, path).await.unwrap();
        let err = Listener::bind(Network::Unix, path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        // The first listener still owns the path.
        let _client = Stream::connect(Network::Unix, path).await.unwrap();
        live.accept().await.unwrap();
    }

    #[tokio::test]
    async fn test_adopted_listener_accepts() {
        let listener = Listener::bind(Network::Tcp, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dup = listener.as_fd().try_clone_to_owned().unwrap();
        let adopted = Listener::from_owned_fd(Network::Tcp, dup).unwrap();
        assert_eq!(adopted.local_addr().unwrap(), addr);

        let mut client = Stream::connect(Network::Tcp, &addr).await.unwrap();
        let mut server = adopted.accept().await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
