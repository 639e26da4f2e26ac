//! Local HTTP surface: `/healthz`, `/metrics` and `/v1/ports`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pkg_metrics::{MetricsRegistry, ProcessCollector};
use pkg_nginx::ProxyRuntime;
use pkg_portalloc::PortAllocator;
use pkg_types::error::{ErrorKind, kind_of};

use crate::lifecycle::{GatewayState, Lifecycle};
use crate::queue::{Task, TaskQueue};

#[derive(Clone)]
pub struct HttpState {
    pub lifecycle: Arc<Lifecycle>,
    pub runtime: Arc<dyn ProxyRuntime>,
    pub registry: Arc<MetricsRegistry>,
    pub process: Arc<ProcessCollector>,
    pub allocator: Arc<PortAllocator>,
    pub queue: Arc<TaskQueue>,
}

#[derive(Debug, Deserialize)]
pub struct AllocateRequest {
    pub service_id: String,
    pub container_port: u16,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error(status: StatusCode, message: String) -> axum::response::Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/v1/ports", get(list_ports).post(allocate_port))
        .with_state(state)
}

async fn healthz(State(state): State<HttpState>) -> impl IntoResponse {
    let phase = state.lifecycle.get();
    if phase != GatewayState::Running {
        return (StatusCode::SERVICE_UNAVAILABLE, phase.to_string());
    }
    if !state.runtime.healthy().await {
        return (StatusCode::SERVICE_UNAVAILABLE, "proxy not answering".to_string());
    }
    (StatusCode::OK, "ok".to_string())
}

async fn metrics(State(state): State<HttpState>) -> impl IntoResponse {
    state.process.collect();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.registry.render(),
    )
}

async fn list_ports(State(state): State<HttpState>) -> axum::response::Response {
    match state.allocator.list().await {
        Ok(list) => (StatusCode::OK, Json(list)).into_response(),
        Err(e) => {
            warn!("Failed to list port allocations: {}", e);
            error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

async fn allocate_port(
    State(state): State<HttpState>,
    Json(req): Json<AllocateRequest>,
) -> axum::response::Response {
    match state
        .allocator
        .allocate(&req.service_id, req.container_port)
        .await
    {
        Ok(allocation) => {
            state.queue.add(Task::port_allocation(
                &allocation.service_id,
                allocation.container_port,
            ));
            (StatusCode::OK, Json(allocation)).into_response()
        }
        Err(e) => match kind_of(&e) {
            ErrorKind::ResourceExhaustion => error(StatusCode::CONFLICT, e.to_string()),
            _ => {
                warn!(
                    "Port allocation for {}:{} failed: {}",
                    req.service_id, req.container_port, e
                );
                error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        },
    }
}

/// Serve the router until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    state: HttpState,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr).await?;
    info!("Health and metrics server listening on {}", addr);
    let app = router(state);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            warn!("Health server error: {}", e);
        }
    }))
}
