//! Health check endpoints

use crate::client::PubSub;
use crate::metrics::{self, PubSubMetrics};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub project_id: String,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub transport_connected: bool,
    pub receiving: bool,
    pub subscription: String,
    pub messages_published: u64,
    pub publish_failures: u64,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub pubsub: PubSub,
    pub project_id: String,
    pub subscription: String,
    /// Set once the subscription is provisioned and the receive loop runs
    pub receiving: Arc<AtomicBool>,
    pub metrics: Option<PubSubMetrics>,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        project_id: state.project_id.clone(),
    })
}

/// Readiness endpoint - 200 once receiving over a live connection
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = ready_response(&state);
    let status = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

fn ready_response(state: &AppState) -> ReadyResponse {
    let transport_connected = state.pubsub.is_connected();
    let receiving = state.receiving.load(Ordering::SeqCst);

    ReadyResponse {
        ready: transport_connected && receiving,
        transport_connected,
        receiving,
        subscription: state.subscription.clone(),
        messages_published: state.pubsub.messages_published(),
        publish_failures: state.pubsub.publish_failures(),
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    metrics::set_transport_connected(state.pubsub.is_connected());

    let body = state
        .metrics
        .as_ref()
        .map(PubSubMetrics::render)
        .unwrap_or_default();

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn state() -> AppState {
        AppState {
            pubsub: PubSub::connect(&Config::local("arrakis")).await.unwrap(),
            project_id: "arrakis".to_string(),
            subscription: "guild-events-audit".to_string(),
            receiving: Arc::new(AtomicBool::new(false)),
            metrics: None,
        }
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.2.0",
            project_id: "arrakis".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("\"project_id\":\"arrakis\""));
    }

    #[tokio::test]
    async fn test_not_ready_until_receiving() {
        let state = state().await;
        assert!(!ready_response(&state).ready);

        state.receiving.store(true, Ordering::SeqCst);
        let response = ready_response(&state);
        assert!(response.ready);

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"ready\":true"));
    }

    #[tokio::test]
    async fn test_not_ready_after_close() {
        let state = state().await;
        state.receiving.store(true, Ordering::SeqCst);
        state.pubsub.close().await.unwrap();

        let response = ready_response(&state);
        assert!(!response.ready);
        assert!(!response.transport_connected);
    }
}
