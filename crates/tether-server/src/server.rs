//! `TetherServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use tether_circuits::CircuitRegistry;
use tether_core::ConnectionId;
use tether_settings::ServerSettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::beacon::{disconnect_beacon, visibility_beacon};
use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::rpc::registry::MethodRegistry;
use crate::shutdown::{ServerTask, ShutdownCoordinator};
use crate::websocket::session::{SessionConfig, run_ws_session};

/// WebSocket endpoint path.
pub const CIRCUIT_PATH: &str = "/_tether";
/// Disconnect beacon path.
pub const DISCONNECT_PATH: &str = "/_tether/disconnect";
/// Page-visibility beacon path.
pub const VISIBILITY_PATH: &str = "/_tether/visibility";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Every circuit in the process.
    pub circuits: Arc<CircuitRegistry>,
    /// RPC method registry.
    pub methods: Arc<MethodRegistry>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Open WebSocket connections.
    pub connections: Arc<AtomicUsize>,
    /// Prometheus handle, if a recorder was installed.
    pub metrics: Option<PrometheusHandle>,
    /// Per-connection limits.
    pub session: SessionConfig,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

/// The main Tether server.
pub struct TetherServer {
    settings: ServerSettings,
    state: AppState,
    tasks: Mutex<Vec<ServerTask>>,
    fault_listener: Mutex<Option<JoinHandle<()>>>,
}

impl TetherServer {
    /// Create a new server.
    pub fn new(
        settings: ServerSettings,
        circuits: Arc<CircuitRegistry>,
        methods: MethodRegistry,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let state = AppState {
            circuits,
            methods: Arc::new(methods),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            connections: Arc::new(AtomicUsize::new(0)),
            metrics,
            session: SessionConfig::from(&settings),
            max_message_size: settings.max_message_size,
        };
        Self {
            settings,
            state,
            tasks: Mutex::new(Vec::new()),
            fault_listener: Mutex::new(None),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route(CIRCUIT_PATH, get(ws_handler))
            .route(DISCONNECT_PATH, post(disconnect_beacon))
            .route(VISIBILITY_PATH, post(visibility_beacon))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the listener and start serving, along with the eviction sweep
    /// and fault listener. Returns the bound address.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        let token = self.state.shutdown.token();
        let app = self.router();
        let serve_token = token.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(serve_token.cancelled_owned())
                .await;
            if let Err(e) = result {
                warn!(error = %e, "server exited with error");
            }
        });

        let sweep = self.state.circuits.spawn_eviction_sweep(token);
        let mut tasks = self.tasks.lock();
        tasks.push(ServerTask::new("http", server));
        tasks.push(ServerTask::new("eviction_sweep", sweep));
        if let Some(listener) = self.state.circuits.spawn_fault_listener() {
            *self.fault_listener.lock() = Some(listener);
        }

        info!(addr = %local_addr, "tether server listening");
        Ok(local_addr)
    }

    /// Stop accepting connections, end open sessions, and terminate every
    /// circuit.
    pub async fn stop(&self, timeout: Option<Duration>) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let aborted = self.state.shutdown.graceful_shutdown(tasks, timeout).await;
        if !aborted.is_empty() {
            warn!(?aborted, "tasks aborted during shutdown");
        }
        let terminated = self.state.circuits.terminate_all().await;
        if let Some(listener) = self.fault_listener.lock().take() {
            listener.abort();
        }
        info!(terminated, "tether server stopped");
    }

    /// Get the circuit registry.
    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.state.circuits
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Get the method registry.
    pub fn methods(&self) -> &Arc<MethodRegistry> {
        &self.state.methods
    }

    /// Open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::Relaxed)
    }
}

/// GET /_tether: upgrade to a circuit session.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let connection_id = ConnectionId::new();
    let shutdown = state.shutdown.token();
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| {
            run_ws_session(
                socket,
                connection_id,
                state.methods,
                state.circuits,
                state.session,
                state.connections,
                shutdown,
            )
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connections.load(Ordering::Relaxed),
        state.circuits.connected_count(),
        state.circuits.disconnected_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    use crate::rpc::handlers::register_all;
    use crate::rpc::handlers::test_helpers::test_registry;

    pub(crate) fn make_server_with(circuits: Arc<CircuitRegistry>) -> TetherServer {
        let settings = ServerSettings {
            port: 0,
            ..ServerSettings::default()
        };
        let mut methods = MethodRegistry::new();
        register_all(&mut methods);
        TetherServer::new(settings, circuits, methods, None)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn accessors() {
        let server = make_server_with(test_registry());
        assert_eq!(server.settings().port, 0);
        assert!(server.methods().has_method("StartCircuit"));
        assert!(!server.shutdown().is_shutting_down());
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.circuits().connected_count(), 0);
    }

    #[tokio::test]
    async fn health_endpoint_reports_circuits() {
        let server = make_server_with(test_registry());
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["active_circuits"], 0);
        assert_eq!(body["disconnected_circuits"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_without_recorder() {
        let server = make_server_with(test_registry());
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_handle() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let settings = ServerSettings::default();
        let server = TetherServer::new(settings, test_registry(), MethodRegistry::new(), Some(handle));
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn plain_get_on_circuit_path_is_not_an_upgrade() {
        let server = make_server_with(test_registry());
        let req = Request::builder().uri(CIRCUIT_PATH).body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server_with(test_registry());
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_and_stop() {
        let server = make_server_with(test_registry());
        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.stop(Some(Duration::from_secs(5))).await;
        assert!(server.shutdown().is_shutting_down());
    }
}
