//! Management/observability endpoint: health, metrics, live sessions and
//! REST route management.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::lodestone::{routes::RouteTable, telemetry};

#[derive(Clone)]
pub struct AdminState {
    pub metrics: telemetry::SharedMetrics,
    pub sessions: telemetry::SharedSessions,
    pub routes: Arc<RouteTable>,
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/conns", get(conns))
        .route("/routes", get(list_routes).post(create_route))
        .route("/routes/{host}", delete(delete_route))
        .route("/defaultRoute", post(set_default_route))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tracing::info!(api_binding = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.metrics.snapshot()))
}

async fn conns(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.sessions.snapshot()))
}

async fn list_routes(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.routes.snapshot()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRouteRequest {
    server_address: String,
    backend: String,
}

async fn create_route(
    State(st): State<Arc<AdminState>>,
    Json(req): Json<CreateRouteRequest>,
) -> impl IntoResponse {
    if req.server_address.trim().is_empty() || req.backend.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    st.routes.create_mapping(&req.server_address, &req.backend);
    tracing::info!(host = %req.server_address, backend = %req.backend, "admin: mapping created");
    StatusCode::CREATED
}

async fn delete_route(
    State(st): State<Arc<AdminState>>,
    Path(host): Path<String>,
) -> impl IntoResponse {
    if st.routes.delete_mapping(&host) {
        tracing::info!(host = %host, "admin: mapping deleted");
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DefaultRouteRequest {
    /// Empty clears the default route.
    #[serde(default)]
    backend: String,
}

async fn set_default_route(
    State(st): State<Arc<AdminState>>,
    Json(req): Json<DefaultRouteRequest>,
) -> impl IntoResponse {
    st.routes.set_default_route(&req.backend);
    tracing::info!(backend = %req.backend, "admin: default route set");
    StatusCode::OK
}
