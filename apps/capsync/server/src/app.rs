//! HTTP surface: the two WebSocket channels plus health, stats and metrics.

use std::{future::Future, net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::header,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::net::TcpListener;
use tracing::info;

use crate::{hub::SyncHub, session};

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
  <body>
    <h1>capsync is online</h1>
    <p>Participants connect to <code>/ws</code> and send <code>1</code> or <code>0</code>.</p>
    <p>Observers connect to <code>/status</code>.</p>
  </body>
</html>
"#;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read local address of listener")]
    LocalAddr(#[source] std::io::Error),
    #[error("server terminated with error")]
    Serve(#[source] std::io::Error),
}

pub struct AppState {
    pub hub: Arc<SyncHub>,
    pub metrics: PrometheusHandle,
    pub started_at: OffsetDateTime,
}

impl AppState {
    pub fn new(hub: Arc<SyncHub>, metrics: PrometheusHandle) -> Self {
        Self {
            hub,
            metrics,
            started_at: OffsetDateTime::now_utc(),
        }
    }

    fn stats(&self) -> StatsResponse {
        let snapshot = self.hub.state().snapshot();
        let registry = self.hub.registry();
        let started_at = self
            .started_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.started_at.unix_timestamp().to_string());
        StatsResponse {
            enabled: snapshot.enabled,
            version: snapshot.version,
            participants: registry.participant_count(),
            observers: registry.observer_count(),
            state_fanouts: self.hub.broadcaster().fanout_count(),
            started_at,
            uptime_seconds: (OffsetDateTime::now_utc() - self.started_at).whole_seconds(),
        }
    }

    fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub enabled: bool,
    pub version: u64,
    pub participants: usize,
    pub observers: usize,
    pub state_fanouts: u64,
    pub started_at: String,
    pub uptime_seconds: i64,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(participant_handler))
        .route("/status", get(observer_handler))
        .with_state(state)
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, TransportError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| TransportError::Bind { addr, source })
}

/// Serves `state` on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: F,
) -> Result<(), TransportError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr().map_err(TransportError::LocalAddr)?;
    info!(%local_addr, "capsync listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(TransportError::Serve)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn participant_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let hub = Arc::clone(&state.hub);
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        session::run_participant(hub, stream, sink, remote_addr).await;
    })
}

async fn observer_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let hub = Arc::clone(&state.hub);
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        session::run_observer(hub, stream, sink, remote_addr).await;
    })
}
