//! Control client: finds the previous generation and fetches its state.

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, info, warn};

use super::wire::{HelloRequest, HelloResponse, TransferRequest, TransferResponse, PROTOCOL_VERSION};
use crate::config::UpgradeConfig;
use crate::error::HandshakeError;
use crate::migratable::TransferPayload;

/// Client side of the control plane.
///
/// Idle connections are never pooled: every attempt opens a fresh TCP
/// connection, so the kernel picks a responder per attempt and answers from
/// this generation's own control server can be retried away.
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    addr: SocketAddr,
    generation: u32,
    probe_timeout: Duration,
    transfer_timeout: Duration,
    attempts: u32,
}

impl ControlClient {
    /// Client for `addr`, calling as `generation`.
    pub fn new(addr: SocketAddr, generation: u32) -> Result<Self, HandshakeError> {
        let defaults = UpgradeConfig::default();
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            addr,
            generation,
            probe_timeout: defaults.probe_timeout,
            transfer_timeout: defaults.transfer_timeout,
            attempts: defaults.handshake_attempts,
        })
    }

    /// Client configured from the generation configuration.
    pub fn from_config(config: &UpgradeConfig, generation: u32) -> Result<Self, HandshakeError> {
        Ok(Self::new(config.control_addr, generation)?
            .with_timeouts(config.probe_timeout, config.transfer_timeout)
            .with_attempts(config.handshake_attempts))
    }

    /// Set per-attempt timeouts.
    pub fn with_timeouts(mut self, probe: Duration, transfer: Duration) -> Self {
        self.probe_timeout = probe;
        self.transfer_timeout = transfer;
        self
    }

    /// Set the number of attempts per call (at least one).
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Look for a generation other than this one.
    ///
    /// Returns [`HandshakeError::Unavailable`] when nothing listens, every
    /// attempt times out, or only this generation answers.
    pub async fn probe(&self) -> Result<HelloResponse, HandshakeError> {
        let url = self.url("/hello");
        let request = HelloRequest {
            generation: Some(self.generation),
        };

        for attempt in 1..=self.attempts {
            let response = match self
                .http
                .post(&url)
                .timeout(self.probe_timeout)
                .json(&request)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_connect() => {
                    debug!(addr = %self.addr, error = %e, "Nothing listens on the control address");
                    break;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Probe attempt failed");
                    continue;
                }
            };

            if !response.status().is_success() {
                debug!(attempt, status = %response.status(), "Probe got an error status");
                continue;
            }

            let hello: HelloResponse = match response.json().await {
                Ok(hello) => hello,
                Err(e) => {
                    debug!(attempt, error = %e, "Unreadable hello response");
                    continue;
                }
            };

            if hello.generation == Some(self.generation) {
                debug!(attempt, "Probe answered by this generation, retrying");
                continue;
            }

            if hello.version != PROTOCOL_VERSION {
                warn!(
                    version = hello.version,
                    expected = PROTOCOL_VERSION,
                    "Predecessor speaks another protocol version"
                );
            }
            info!(predecessor = ?hello.generation, attempt, "Found predecessor");
            return Ok(hello);
        }

        Err(HandshakeError::Unavailable { addr: self.addr })
    }

    /// Ask another generation to drain and hand over its servers.
    pub async fn fetch_transfer(&self) -> Result<TransferPayload, HandshakeError> {
        let url = self.url("/transfer");
        let request = TransferRequest {
            generation: Some(self.generation),
        };
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.attempts {
            let response = match self
                .http
                .post(&url)
                .timeout(self.transfer_timeout)
                .json(&request)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    debug!(attempt, error = %e, "Transfer attempt failed");
                    last_error = e.to_string();
                    continue;
                }
            };

            match response.status() {
                StatusCode::CONFLICT => {
                    debug!(attempt, "Transfer reached this generation, retrying");
                    last_error = "only this generation answered".to_string();
                    continue;
                }
                status if !status.is_success() => {
                    debug!(attempt, %status, "Transfer got an error status");
                    last_error = format!("status {status}");
                    continue;
                }
                _ => {}
            }

            match response.json::<TransferResponse>().await {
                Ok(transfer) if transfer.generation == Some(self.generation) => {
                    last_error = "only this generation answered".to_string();
                }
                Ok(transfer) => {
                    info!(
                        predecessor = ?transfer.generation,
                        servers = transfer.servers_transfer_data.len(),
                        "Received transfer payload"
                    );
                    return Ok(transfer.servers_transfer_data);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Unreadable transfer response");
                    last_error = e.to_string();
                }
            }
        }

        Err(HandshakeError::Fetch(last_error))
    }
}
