use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::punchgate::{
    context::ProxyContext, punch::puncher::HolePuncher, telemetry::SharedPrometheusHandle,
    tunnel::mux::Multiplexer,
};

#[derive(Clone)]
pub struct AdminState {
    pub prom: SharedPrometheusHandle,
    pub ctx: Arc<ProxyContext>,
    pub puncher: Arc<HolePuncher>,
    pub mux: Arc<Multiplexer>,
    pub config_path: PathBuf,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/peers", get(peers))
        .route("/links", get(links))
        .route("/directory", get(directory))
        .route("/config", get(config))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %listener.local_addr()?, "admin: listening");

    axum::serve(listener, router(state))
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
    identity: Option<String>,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let identity = st.ctx.identity().map(|id| id.to_string());
    (StatusCode::OK, Json(HealthResponse { ok: true, identity }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn peers(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.puncher.snapshot().await))
}

#[derive(Debug, Serialize)]
struct LinksResponse {
    links: Vec<crate::punchgate::tunnel::mux::LinkSnapshot>,
    pending_requests: usize,
}

async fn links(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(LinksResponse {
            links: st.mux.snapshot_links(),
            pending_requests: st.mux.pending_requests(),
        }),
    )
}

async fn directory(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json((*st.ctx.directory()).clone()))
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    path: String,
}

async fn config(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ConfigResponse {
            path: st.config_path.display().to_string(),
        }),
    )
}
