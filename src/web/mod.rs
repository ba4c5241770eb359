pub mod command;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, warn};

use crate::cache::TelemetryCache;
use crate::metrics::Metrics;

const INDEX_HTML: &str = include_str!("../../resources/index.html");
const LIB_JS: &str = include_str!("../../resources/lib.js");

#[derive(Clone)]
pub struct AppState {
    pub cache: TelemetryCache,
    pub metrics: Arc<Metrics>,
    pub heartbeat: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/socket", get(socket))
        .route("/devices/{id}/daystat", get(daystat))
        .route("/", get(index))
        .route("/lib.js", get(lib_js))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Serve HTTP on `addr` until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn log_request(req: Request, next: Next) -> Response {
    debug!("{} {}", req.method(), req.uri().path());
    next.run(req).await
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn lib_js() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/javascript")], LIB_JS)
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| session::run(socket, state.cache, state.heartbeat))
}

#[derive(Deserialize)]
struct DayStatQuery {
    month: u32,
    year: i32,
}

async fn daystat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DayStatQuery>,
) -> Response {
    let Some(client) = state.cache.client(&id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match client.daily_stats(query.month, query.year).await {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            warn!("Daily stats for {} failed: {}", id, e);
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}
