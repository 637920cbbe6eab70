//! Control API consumed by the dashboard and CLI collaborators.
//!
//! Reads go against the live supervisor map; mutations reuse the same
//! `wake_app`/`sleep_app` paths the control loop uses.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use napper_protocol::{
    ControlAction, ControlRequest, ControlResponse, HealthReport, StatusSnapshot,
};

use crate::errors::Result;
use crate::supervisor::Supervisor;

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/control", post(post_control))
        .route("/health", get(get_health))
        .route("/up", get(get_up))
        .with_state(supervisor)
}

/// Serve the control API until the supervisor's shutdown flag trips.
pub async fn serve(supervisor: Arc<Supervisor>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Control API listening on {}", addr);

    let mut shutdown_rx = supervisor.shutdown_signal();
    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|shutting_down| *shutting_down).await;
        })
        .await?;
    Ok(())
}

async fn get_status(State(supervisor): State<Arc<Supervisor>>) -> Json<StatusSnapshot> {
    Json(supervisor.status())
}

async fn post_control(
    State(supervisor): State<Arc<Supervisor>>,
    Json(request): Json<ControlRequest>,
) -> Json<ControlResponse> {
    info!("Control request: {} {}", request.action, request.host);

    let success = match request.action {
        ControlAction::Wake => supervisor.wake_app(&request.host).await,
        ControlAction::Sleep => supervisor.sleep_app(&request.host).await,
    };

    let message = match (request.action, success) {
        (ControlAction::Wake, true) => format!("{} is starting", request.host),
        (ControlAction::Wake, false) => format!("{} was not asleep", request.host),
        (ControlAction::Sleep, true) => format!("{} is stopping", request.host),
        (ControlAction::Sleep, false) => format!("{} was not active", request.host),
    };

    Json(ControlResponse {
        success,
        hostname: request.host,
        action: request.action,
        message,
    })
}

async fn get_health(State(supervisor): State<Arc<Supervisor>>) -> Json<HealthReport> {
    Json(HealthReport::ok(crate::VERSION, supervisor.now()))
}

async fn get_up() -> &'static str {
    "OK"
}
