//! `RwsServer`: Axum HTTP + `WebSocket` server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use rws_core::{RwsContext, RwsError};
use serde_json::json;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::{SessionLimits, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session registry and object registry.
    pub context: Arc<RwsContext>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Open connection accounting.
    pub slots: Arc<ConnectionSlots>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

/// Counts open `WebSocket` connections against the configured maximum.
#[derive(Debug)]
pub struct ConnectionSlots {
    active: AtomicUsize,
    max: usize,
}

impl ConnectionSlots {
    /// Allow up to `max` concurrent connections.
    pub fn new(max: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max,
        }
    }

    /// Claim a slot, or `None` at the limit. The slot is released on drop.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionSlot> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()
            .map(|_| ConnectionSlot {
                slots: Arc::clone(self),
            })
    }

    /// Slots currently held.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// A held connection slot.
#[derive(Debug)]
pub struct ConnectionSlot {
    slots: Arc<ConnectionSlots>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.slots.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The gateway server.
pub struct RwsServer {
    config: Arc<ServerConfig>,
    context: Arc<RwsContext>,
    shutdown: Arc<ShutdownCoordinator>,
    slots: Arc<ConnectionSlots>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl RwsServer {
    /// Create a server for `context`.
    pub fn new(config: ServerConfig, context: Arc<RwsContext>) -> Self {
        let slots = Arc::new(ConnectionSlots::new(config.max_connections));
        Self {
            config: Arc::new(config),
            context,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            slots,
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            context: Arc::clone(&self.context),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            slots: Arc::clone(&self.slots),
            config: Arc::clone(&self.config),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .route("/rws/objects", get(objects_handler))
            .route("/rws/object/{name}", get(object_script_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and start serving in the background.
    ///
    /// Returns the bound address and the serve task. The task ends after
    /// [`ShutdownCoordinator::shutdown`], once every session is torn down.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        info!(%local, "rws server listening");

        let router = self.router();
        let token = self.shutdown.token();
        let context = Arc::clone(&self.context);
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = served {
                error!(error = %e, "server stopped with error");
            }
            context.shutdown();
            info!("rws server stopped");
        });
        Ok((local, handle))
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<RwsContext> {
        &self.context
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open `WebSocket` connections.
    pub fn connection_count(&self) -> usize {
        self.slots.active()
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.slots.active(),
        state.context.session_count(),
        state.context.registry().object_names().len(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET /ws: upgrade, subject to the connection limit.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    let Some(slot) = state.slots.try_acquire() else {
        warn!(max = state.config.max_connections, "connection limit reached, refusing upgrade");
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    let limits = SessionLimits {
        send_queue_capacity: state.config.send_queue_capacity,
        heartbeat_interval: state.config.heartbeat_interval(),
        heartbeat_timeout: state.config.heartbeat_timeout(),
    };
    let context = Arc::clone(&state.context);
    let shutdown = state.shutdown.token();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let _slot = slot;
            run_ws_session(socket, context, limits, shutdown).await;
        })
}

/// GET /rws/objects
async fn objects_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "objects": state.context.registry().object_names() }))
}

/// GET /rws/object/{name}: client script for one object. A trailing `.js`
/// is accepted.
async fn object_script_handler(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let name = name.strip_suffix(".js").unwrap_or(&name);
    debug!(object = name, "object script requested");
    match state.context.registry().object_script(name) {
        Ok(script) => (
            [(header::CONTENT_TYPE, "text/javascript; charset=UTF-8")],
            script,
        )
            .into_response(),
        Err(RwsError::UnknownObject { .. }) => (
            StatusCode::NOT_FOUND,
            format!("Unknown RWS object '{name}'"),
        )
            .into_response(),
        Err(e) => {
            error!(object = name, error = %e, "object script generation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use rws_core::{CapabilityDescriptor, MethodTable, Native};
    use tower::ServiceExt;

    #[derive(Debug, Default)]
    struct Counter;

    fn make_server() -> RwsServer {
        let context = RwsContext::with_builtins();
        let table = MethodTable::<Counter>::new()
            .factory(|| Ok(Counter))
            .operation("next", &[], |_, _, _| Ok(Native::wire(1)));
        let _ = context.registry().register(
            CapabilityDescriptor::builder("counter", Arc::new(table))
                .build()
                .unwrap(),
        );
        RwsServer::new(ServerConfig::default(), context)
    }

    async fn get(server: &RwsServer, uri: &str) -> (StatusCode, String) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn slots_enforce_maximum() {
        let slots = Arc::new(ConnectionSlots::new(2));
        let a = slots.try_acquire().unwrap();
        let _b = slots.try_acquire().unwrap();
        assert!(slots.try_acquire().is_none());
        drop(a);
        assert_eq!(slots.active(), 1);
        assert!(slots.try_acquire().is_some());
    }

    #[tokio::test]
    async fn health_endpoint_reports_counts() {
        let server = make_server();
        let (status, body) = get(&server, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["sessions"], 0);
        assert_eq!(parsed["objects"], 2);
    }

    #[tokio::test]
    async fn objects_endpoint_lists_registered_names() {
        let server = make_server();
        let (status, body) = get(&server, "/rws/objects").await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        let names: Vec<&str> = parsed["objects"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(names.contains(&"counter"));
        assert!(names.contains(&"__this__"));
    }

    #[tokio::test]
    async fn object_script_endpoint() {
        let server = make_server();
        let (status, body) = get(&server, "/rws/object/counter.js").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("counter.next = function(onsuccess, onfailure) {"));

        let (status, plain) = get(&server, "/rws/object/counter").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(plain, body);
    }

    #[tokio::test]
    async fn unknown_object_script_is_404() {
        let server = make_server();
        let (status, body) = get(&server, "/rws/object/nope.js").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "Unknown RWS object 'nope'");
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let server = make_server();
        let (status, _) = get(&server, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_handle_renders() {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let server = make_server().with_metrics(handle);
        let (status, _) = get(&server, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn plain_get_on_ws_is_rejected() {
        let server = make_server();
        let (status, _) = get(&server, "/ws").await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let (status, _) = get(&server, "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_and_stops_on_shutdown() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
