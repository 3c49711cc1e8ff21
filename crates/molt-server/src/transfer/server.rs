//! Control server: answers `/hello` and `/transfer` for this generation.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tokio::net::TcpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::wire::{
    parse_body, HelloRequest, HelloResponse, TransferRequest, TransferResponse, PROTOCOL_VERSION,
};
use crate::migratable::{ServerRegistry, TransferPayload};

const LISTEN_BACKLOG: u32 = 1024;

struct ControlState {
    generation: u32,
    registry: Arc<ServerRegistry>,
    /// Last payload handed to a successor.
    handout: Mutex<Option<TransferPayload>>,
}

/// Running control server of one generation.
///
/// Every generation binds the same loopback address with `SO_REUSEPORT`, so
/// during a handoff the kernel spreads requests over both generations.
pub struct ControlServer {
    local_addr: SocketAddr,
    state: Arc<ControlState>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<io::Result<()>>>>,
}

impl std::fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlServer")
            .field("local_addr", &self.local_addr)
            .field("generation", &self.state.generation)
            .finish()
    }
}

impl ControlServer {
    /// Bind `addr` with address and port reuse and start serving.
    pub async fn bind(
        addr: SocketAddr,
        generation: u32,
        registry: Arc<ServerRegistry>,
    ) -> io::Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_reuseport(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(ControlState {
            generation,
            registry,
            handout: Mutex::new(None),
        });
        let app = router(Arc::clone(&state));

        let stop = CancellationToken::new();
        let stop_token = stop.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    stop_token.cancelled().await;
                    debug!("Control server received shutdown signal");
                })
                .await
        });

        info!(addr = %local_addr, generation, "Control server listening");
        Ok(Self {
            local_addr,
            state,
            stop,
            task: Mutex::new(Some(task)),
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take the payload last handed to a successor, if any.
    ///
    /// After a failed upgrade the generation restores it into itself.
    pub fn take_handout(&self) -> Option<TransferPayload> {
        self.state
            .handout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Stop serving, waiting at most `grace` for in-flight requests.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut task) = task else {
            return;
        };
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(Ok(()))) => info!("Control server stopped"),
            Ok(Ok(Err(e))) => warn!(error = %e, "Control server stopped with error"),
            Ok(Err(e)) => error!(error = %e, "Control server task failed"),
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Control server did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/hello", post(hello_handler))
        .route("/transfer", post(transfer_handler))
        .with_state(state)
}

/// POST /hello
async fn hello_handler(State(state): State<Arc<ControlState>>, body: Bytes) -> Response {
    let request: HelloRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return bad_request(e),
    };
    debug!(caller = ?request.generation, "Hello");

    Json(HelloResponse {
        version: PROTOCOL_VERSION,
        generation: Some(state.generation),
    })
    .into_response()
}

/// POST /transfer
///
/// Drains every registered server and returns their blobs. A caller naming
/// this generation gets `409 Conflict` and nothing is drained.
async fn transfer_handler(State(state): State<Arc<ControlState>>, body: Bytes) -> Response {
    let request: TransferRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return bad_request(e),
    };

    if request.generation == Some(state.generation) {
        debug!("Refusing transfer requested by this generation");
        return (StatusCode::CONFLICT, "cannot transfer to self").into_response();
    }

    info!(successor = ?request.generation, "Transfer requested, draining servers");

    // Runs to completion even if the caller goes away mid-drain.
    let drain_state = Arc::clone(&state);
    let drained = tokio::spawn(async move {
        let payload = drain_state.registry.transfer_all().await;
        *drain_state
            .handout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(payload.clone());
        payload
    })
    .await;

    match drained {
        Ok(payload) => {
            info!(servers = payload.len(), "Transfer payload handed out");
            Json(TransferResponse {
                servers_transfer_data: payload,
                generation: Some(state.generation),
            })
            .into_response()
        }
        Err(e) => {
            error!(error = %e, "Transfer task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "transfer failed").into_response()
        }
    }
}

fn bad_request(e: serde_json::Error) -> Response {
    debug!(error = %e, "Malformed control request");
    (StatusCode::BAD_REQUEST, e.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migratable::tests::FakeServer;

    fn registry_with(name: &str, blob: Option<&str>) -> Arc<ServerRegistry> {
        let mut registry = ServerRegistry::new();
        registry
            .register(Arc::new(FakeServer::new(name, blob)))
            .unwrap();
        Arc::new(registry)
    }

    fn http() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    fn any_port() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn test_hello_answers_with_generation() {
        let server = ControlServer::bind(any_port(), 11, registry_with("a", None))
            .await
            .unwrap();
        let url = format!("http://{}/hello", server.local_addr());

        let response = http().post(&url).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let hello: HelloResponse = response.json().await.unwrap();
        assert_eq!(hello.version, PROTOCOL_VERSION);
        assert_eq!(hello.generation, Some(11));

        server.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_transfer_to_self_is_refused() {
        let server = ControlServer::bind(any_port(), 11, registry_with("a", Some("blob")))
            .await
            .unwrap();
        let url = format!("http://{}/transfer", server.local_addr());

        let response = http()
            .post(&url)
            .json(&TransferRequest {
                generation: Some(11),
            })
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
        assert!(server.take_handout().is_none());
    }

    #[tokio::test]
    async fn test_transfer_records_handout() {
        let server = ControlServer::bind(any_port(), 11, registry_with("a", Some("blob")))
            .await
            .unwrap();
        let url = format!("http://{}/transfer", server.local_addr());

        let response: TransferResponse = http()
            .post(&url)
            .body("{}")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response.generation, Some(11));
        assert_eq!(
            response.servers_transfer_data.get("a").map(String::as_str),
            Some("blob")
        );

        let handout = server.take_handout().unwrap();
        assert_eq!(handout, response.servers_transfer_data);
        assert!(server.take_handout().is_none());
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let server = ControlServer::bind(any_port(), 11, registry_with("a", None))
            .await
            .unwrap();
        let url = format!("http://{}/hello", server.local_addr());

        let response = http()
            .post(&url)
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_two_generations_share_the_address() {
        let first = ControlServer::bind(any_port(), 1, registry_with("a", None))
            .await
            .unwrap();
        let second = ControlServer::bind(first.local_addr(), 2, registry_with("a", None))
            .await
            .unwrap();
        assert_eq!(first.local_addr(), second.local_addr());
    }
}
