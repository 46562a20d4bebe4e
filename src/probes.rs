use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::error::Result;
use crate::leader::LeaderGuard;
use crate::shutdown;
use crate::telemetry;

#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
    leader: Option<LeaderGuard>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_leader(mut self, leader: LeaderGuard) -> Self {
        self.leader = Some(leader);
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn readyz(State(state): State<HealthState>) -> impl IntoResponse {
    let leader = state.leader.as_ref().map(LeaderGuard::is_leader);
    if state.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "ready", "leader": leader })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "leader": leader })),
        )
    }
}

async fn metrics() -> impl IntoResponse {
    match telemetry::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "metrics are not initialized\n".to_string(),
        ),
    }
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics))
}

/// Serves `router` on `addr` until `shutdown` fires.
pub async fn serve(addr: SocketAddr, router: Router, shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown::wait_for(shutdown))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn(router: Router) -> (SocketAddr, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown::wait_for(rx))
                .await
                .unwrap();
        });
        (addr, tx)
    }

    #[tokio::test]
    async fn readiness_follows_the_ready_flag() {
        let state = HealthState::new();
        let (addr, _stop) = spawn(health_router(state.clone())).await;
        let http = reqwest::Client::new();

        let health = http.get(format!("http://{}/healthz", addr)).send().await.unwrap();
        assert_eq!(health.status(), 200);

        let ready = http.get(format!("http://{}/readyz", addr)).send().await.unwrap();
        assert_eq!(ready.status(), 503);

        state.set_ready(true);
        let ready = http.get(format!("http://{}/readyz", addr)).send().await.unwrap();
        assert_eq!(ready.status(), 200);
        let body: serde_json::Value = ready.json().await.unwrap();
        assert_eq!(body["status"], "ready");
        assert!(body["leader"].is_null());
    }
}
