//! Generation configuration loaded from `MOLT_*` environment variables.
//!
//! # Environment Variables
//!
//! - `MOLT_CONTROL_ADDR`: Shared control-plane address. Default: `127.0.0.1:10000`
//! - `MOLT_ECHO_NETWORK`: `unix` or `tcp`. Default: `unix`
//! - `MOLT_ECHO_ADDR`: Echo server address or socket path. Default: `unix.sock`
//! - `MOLT_READ_POLL_MS`: Bounded read interval of connection loops. Default: `10`
//! - `MOLT_WRITE_TIMEOUT_MS`: Echo write timeout. Default: `5000`
//! - `MOLT_PROBE_TIMEOUT_MS`: Per-attempt predecessor probe timeout. Default: `500`
//! - `MOLT_TRANSFER_TIMEOUT_SECS`: Per-attempt transfer fetch timeout. Default: `30`
//! - `MOLT_HANDSHAKE_ATTEMPTS`: Attempts before giving up on a foreign responder. Default: `16`
//! - `MOLT_UPGRADE_TIMEOUT_SECS`: Time a successor gets to become ready. Default: `60`
//!
//! The pid file path comes from the command line (`--pid-file`).

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use molt_ecdysis::{Network, Options};
use tracing::{info, warn};

/// Default shared control-plane address.
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:10000";

/// Configuration of one generation.
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    /// Pid file written when the generation becomes ready
    pub pid_file: PathBuf,
    /// Loopback address shared by every generation's control server
    pub control_addr: SocketAddr,
    /// Echo server socket family
    pub echo_network: Network,
    /// Echo server address (`host:port` or socket path)
    pub echo_addr: String,
    /// Bound on each connection read, and so on cancellation latency
    pub read_poll: Duration,
    /// Bound on each echo write
    pub write_timeout: Duration,
    /// Bound on each probe attempt
    pub probe_timeout: Duration,
    /// Bound on each transfer fetch attempt
    pub transfer_timeout: Duration,
    /// Attempts made to reach a generation other than this one
    pub handshake_attempts: u32,
    /// Time a spawned successor gets to declare readiness
    pub upgrade_timeout: Duration,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from("main.pid"),
            control_addr: SocketAddr::from(([127, 0, 0, 1], 10000)),
            echo_network: Network::Unix,
            echo_addr: "unix.sock".to_string(),
            read_poll: Duration::from_millis(10),
            write_timeout: Duration::from_millis(5000),
            probe_timeout: Duration::from_millis(500),
            transfer_timeout: Duration::from_secs(30),
            handshake_attempts: 16,
            upgrade_timeout: Duration::from_secs(60),
        }
    }
}

impl UpgradeConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables take their defaults; unparsable ones are reported and
    /// also fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pid_file: defaults.pid_file,
            control_addr: env_or("MOLT_CONTROL_ADDR", defaults.control_addr),
            echo_network: env_or("MOLT_ECHO_NETWORK", defaults.echo_network),
            echo_addr: std::env::var("MOLT_ECHO_ADDR").unwrap_or(defaults.echo_addr),
            read_poll: Duration::from_millis(env_or("MOLT_READ_POLL_MS", 10)),
            write_timeout: Duration::from_millis(env_or("MOLT_WRITE_TIMEOUT_MS", 5000)),
            probe_timeout: Duration::from_millis(env_or("MOLT_PROBE_TIMEOUT_MS", 500)),
            transfer_timeout: Duration::from_secs(env_or("MOLT_TRANSFER_TIMEOUT_SECS", 30)),
            handshake_attempts: env_or("MOLT_HANDSHAKE_ATTEMPTS", defaults.handshake_attempts)
                .max(1),
            upgrade_timeout: Duration::from_secs(env_or("MOLT_UPGRADE_TIMEOUT_SECS", 60)),
        }
    }

    /// Set the pid file path.
    pub fn with_pid_file(mut self, pid_file: impl Into<PathBuf>) -> Self {
        self.pid_file = pid_file.into();
        self
    }

    /// Options for the generation manager.
    pub fn upgrader_options(&self) -> Options {
        Options {
            pid_file: Some(self.pid_file.clone()),
            upgrade_timeout: self.upgrade_timeout,
            ..Options::default()
        }
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        info!("Pid file: {}", self.pid_file.display());
        info!("Control plane: {}", self.control_addr);
        info!("Echo server: {}/{}", self.echo_network, self.echo_addr);
        info!(
            read_poll_ms = self.read_poll.as_millis() as u64,
            write_timeout_ms = self.write_timeout.as_millis() as u64,
            probe_timeout_ms = self.probe_timeout.as_millis() as u64,
            transfer_timeout_secs = self.transfer_timeout.as_secs(),
            handshake_attempts = self.handshake_attempts,
            upgrade_timeout_secs = self.upgrade_timeout.as_secs(),
            "Handoff timing"
        );
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(e) => {
                warn!(key, value = %raw, error = %e, default = %default, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
