//! Server lifecycle
//!
//! Pure state machine: receives events, returns (new_state, action).
//! `ProxyServer` executes the I/O implied by each action and is the control
//! surface used to start, stop and query the listener.
//!
//! Stop sequence:
//! 1. Flip the shutdown watch so open streams end with an error event and
//!    in-flight requests are answered 503
//! 2. Stop accepting and let axum close the remaining connections
//! 3. After `DRAIN_TIMEOUT`, abort the server task

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use provider::{ClassifiedError, ErrorKind};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{ApiError, Error, Result};

/// How long open connections get to close after stop is requested.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ServerState {
    /// No listener bound
    #[default]
    Stopped,
    /// Binding the listener
    Starting,
    /// Accepting connections
    Running { addr: SocketAddr },
    /// Closing connections until `deadline`
    Stopping { addr: SocketAddr, deadline: Instant },
}

/// Events that drive state transitions.
#[derive(Debug)]
pub enum ServerEvent {
    StartRequested { addr: SocketAddr },
    /// Listener bound; `addr` is the actual local address
    ListenerBound { addr: SocketAddr },
    BindFailed(String),
    StopRequested,
    /// Every connection closed before the deadline
    Drained,
    DrainTimeout,
}

/// Actions the caller should execute after a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum ServerAction {
    BindListener { addr: SocketAddr },
    /// Tell streams and the accept loop to wind down
    SignalShutdown,
    /// Drop whatever is still open
    AbortConnections,
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: ServerState, event: ServerEvent) -> (ServerState, ServerAction) {
    match (state, event) {
        (ServerState::Stopped, ServerEvent::StartRequested { addr }) => (
            ServerState::Starting,
            ServerAction::BindListener { addr },
        ),

        (ServerState::Starting, ServerEvent::ListenerBound { addr }) => {
            (ServerState::Running { addr }, ServerAction::None)
        }

        (ServerState::Starting, ServerEvent::BindFailed(_)) => {
            (ServerState::Stopped, ServerAction::None)
        }

        (ServerState::Running { addr }, ServerEvent::StopRequested) => (
            ServerState::Stopping {
                addr,
                deadline: Instant::now() + DRAIN_TIMEOUT,
            },
            ServerAction::SignalShutdown,
        ),

        (ServerState::Stopping { .. }, ServerEvent::Drained) => {
            (ServerState::Stopped, ServerAction::None)
        }

        (ServerState::Stopping { .. }, ServerEvent::DrainTimeout) => {
            (ServerState::Stopped, ServerAction::AbortConnections)
        }

        // Invalid/unhandled transition: stay in current state
        (state, _event) => (state, ServerAction::None),
    }
}

/// Listener status for the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub port: Option<u16>,
}

#[derive(Default)]
struct Inner {
    state: ServerState,
    serve: Option<JoinHandle<std::io::Result<()>>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

/// Owns the router and the listener across start/stop cycles.
pub struct ProxyServer {
    router: Router,
    shutdown: watch::Sender<bool>,
    inner: Mutex<Inner>,
}

impl ProxyServer {
    /// `shutdown` is the channel streams and in-flight requests watch.
    pub fn new(router: Router, shutdown: watch::Sender<bool>) -> Self {
        let router = router.layer(middleware::from_fn_with_state(
            shutdown.subscribe(),
            cancel_on_shutdown,
        ));
        Self {
            router,
            shutdown,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Bind `addr` and start serving. Returns the bound address.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut inner = self.inner.lock().await;
        let (state, action) = handle_event(
            std::mem::take(&mut inner.state),
            ServerEvent::StartRequested { addr },
        );
        let bind_addr = match action {
            ServerAction::BindListener { addr } => addr,
            _ => {
                let running = match state {
                    ServerState::Running { addr } => addr,
                    _ => addr,
                };
                inner.state = state;
                return Err(Error::AlreadyRunning(running));
            }
        };
        inner.state = state;

        let bound = async {
            let listener = TcpListener::bind(bind_addr).await?;
            let local = listener.local_addr()?;
            Ok::<_, std::io::Error>((listener, local))
        }
        .await;
        let (listener, local) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                let (state, _) = handle_event(
                    std::mem::take(&mut inner.state),
                    ServerEvent::BindFailed(source.to_string()),
                );
                inner.state = state;
                return Err(Error::Bind {
                    addr: bind_addr,
                    source,
                });
            }
        };

        self.shutdown.send_replace(false);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let router = self.router.clone();
        inner.serve = Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await
        }));
        inner.stop_tx = Some(stop_tx);

        let (state, _) = handle_event(
            std::mem::take(&mut inner.state),
            ServerEvent::ListenerBound { addr: local },
        );
        inner.state = state;
        info!(addr = %local, "server running, accepting requests");
        Ok(local)
    }

    /// Stop serving and release the port. A no-op when not running.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        let (state, action) = handle_event(std::mem::take(&mut inner.state), ServerEvent::StopRequested);
        inner.state = state;
        if action != ServerAction::SignalShutdown {
            info!("stop requested while not running");
            return;
        }

        self.shutdown.send_replace(true);
        if let Some(stop_tx) = inner.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        let (addr, deadline) = match inner.state {
            ServerState::Stopping { addr, deadline } => (addr, deadline),
            _ => return,
        };
        let event = match inner.serve.as_mut() {
            Some(handle) => match tokio::time::timeout_at(deadline.into(), handle).await {
                Ok(Ok(Ok(()))) => {
                    info!("all connections closed");
                    ServerEvent::Drained
                }
                Ok(Ok(Err(e))) => {
                    error!(error = %e, "server error during shutdown");
                    ServerEvent::Drained
                }
                Ok(Err(e)) => {
                    error!(error = %e, "server task panicked");
                    ServerEvent::Drained
                }
                Err(_) => {
                    warn!(
                        drain_timeout_ms = DRAIN_TIMEOUT.as_millis() as u64,
                        "drain timeout exceeded, aborting open connections"
                    );
                    ServerEvent::DrainTimeout
                }
            },
            None => ServerEvent::Drained,
        };

        let (state, action) = handle_event(std::mem::take(&mut inner.state), event);
        inner.state = state;
        let serve = inner.serve.take();
        if action == ServerAction::AbortConnections
            && let Some(handle) = serve
        {
            handle.abort();
        }
        info!(addr = %addr, "server stopped");
    }

    pub async fn status(&self) -> ServerStatus {
        match self.inner.lock().await.state {
            ServerState::Running { addr } => ServerStatus {
                running: true,
                port: Some(addr.port()),
            },
            _ => ServerStatus {
                running: false,
                port: None,
            },
        }
    }
}

/// Answer 503 for any request still being handled when shutdown starts.
async fn cancel_on_shutdown(
    State(mut shutdown): State<watch::Receiver<bool>>,
    request: Request,
    next: Next,
) -> Response {
    let stopping = async move { shutdown.wait_for(|stopping| *stopping).await.is_ok() };
    tokio::select! {
        response = next.run(request) => response,
        true = stopping => ApiError(
            ClassifiedError::new(ErrorKind::Upstream, "Server is shutting down").with_status(503),
        )
        .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    fn addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_router() -> Router {
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    "late"
                }),
            )
    }

    #[test]
    fn stopped_to_starting_on_start() {
        let (state, action) =
            handle_event(ServerState::Stopped, ServerEvent::StartRequested { addr: addr() });
        assert_eq!(state, ServerState::Starting);
        assert_eq!(action, ServerAction::BindListener { addr: addr() });
    }

    #[test]
    fn starting_to_running_records_bound_addr() {
        let bound: SocketAddr = "127.0.0.1:40123".parse().unwrap();
        let (state, action) =
            handle_event(ServerState::Starting, ServerEvent::ListenerBound { addr: bound });
        assert_eq!(state, ServerState::Running { addr: bound });
        assert_eq!(action, ServerAction::None);
    }

    #[test]
    fn bind_failure_returns_to_stopped() {
        let (state, _) = handle_event(
            ServerState::Starting,
            ServerEvent::BindFailed("address in use".into()),
        );
        assert_eq!(state, ServerState::Stopped);
    }

    #[test]
    fn stop_signals_shutdown_with_deadline() {
        let before = Instant::now();
        let (state, action) =
            handle_event(ServerState::Running { addr: addr() }, ServerEvent::StopRequested);
        assert_eq!(action, ServerAction::SignalShutdown);
        match state {
            ServerState::Stopping { deadline, .. } => assert!(deadline >= before + DRAIN_TIMEOUT),
            other => panic!("expected Stopping, got {other:?}"),
        }
    }

    #[test]
    fn drain_timeout_aborts_connections() {
        let stopping = ServerState::Stopping {
            addr: addr(),
            deadline: Instant::now(),
        };
        let (state, action) = handle_event(stopping.clone(), ServerEvent::DrainTimeout);
        assert_eq!(state, ServerState::Stopped);
        assert_eq!(action, ServerAction::AbortConnections);

        let (state, action) = handle_event(stopping, ServerEvent::Drained);
        assert_eq!(state, ServerState::Stopped);
        assert_eq!(action, ServerAction::None);
    }

    #[test]
    fn invalid_transitions_keep_state() {
        let running = ServerState::Running { addr: addr() };
        let (state, action) =
            handle_event(running.clone(), ServerEvent::StartRequested { addr: addr() });
        assert_eq!(state, running);
        assert_eq!(action, ServerAction::None);

        let (state, action) = handle_event(ServerState::Stopped, ServerEvent::StopRequested);
        assert_eq!(state, ServerState::Stopped);
        assert_eq!(action, ServerAction::None);
    }

    #[tokio::test]
    async fn start_serves_and_stop_releases_port() {
        let (tx, _rx) = watch::channel(false);
        let server = ProxyServer::new(test_router(), tx);

        let bound = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(bound.port(), 0);
        assert_eq!(
            server.status().await,
            ServerStatus {
                running: true,
                port: Some(bound.port())
            }
        );

        let body = reqwest::get(format!("http://{bound}/ping"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pong");

        server.stop().await;
        assert_eq!(
            server.status().await,
            ServerStatus {
                running: false,
                port: None
            }
        );

        // Port is free again
        let rebound = server.start(bound).await.unwrap();
        assert_eq!(rebound, bound);
        server.stop().await;
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (tx, _rx) = watch::channel(false);
        let server = ProxyServer::new(test_router(), tx);
        let bound = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let err = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(a) if a == bound));
        assert!(server.status().await.running);
        server.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_leaves_server_stopped() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let (tx, _rx) = watch::channel(false);
        let server = ProxyServer::new(test_router(), tx);

        let err = server.start(addr).await.unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
        assert!(!server.status().await.running);
    }

    #[tokio::test]
    async fn stop_cuts_in_flight_requests_and_flags_shutdown() {
        let (tx, rx) = watch::channel(false);
        let server = ProxyServer::new(test_router(), tx);
        let bound = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let pending = tokio::spawn(async move { reqwest::get(format!("http://{bound}/slow")).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        server.stop().await;
        assert!(started.elapsed() < DRAIN_TIMEOUT + Duration::from_secs(1));
        assert!(*rx.borrow());

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.status(), 503);
        let json: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
        assert_eq!(json["error"]["type"], "upstream_error");
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_no_op() {
        let (tx, rx) = watch::channel(false);
        let server = ProxyServer::new(test_router(), tx);
        server.stop().await;
        assert!(!*rx.borrow());
        assert!(!server.status().await.running);
    }
}
