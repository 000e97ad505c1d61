//! HTTP surface: iPXE binaries, boot scripts, patched ISOs, health and
//! metrics, all behind the protocol-detecting multiplexer.

pub mod ipxe;
pub mod iso;
pub mod mux;
pub mod script;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::backend::BackendReader;
use crate::binary::Binaries;
use crate::metrics::Metrics;

pub use iso::IsoProxyConfig;
pub use mux::HttpServer;
pub use script::ScriptConfig;

/// Shared state for every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn BackendReader>,
    pub binaries: Arc<Binaries>,
    pub script: Arc<ScriptConfig>,
    pub iso: Arc<IsoProxyConfig>,
    pub metrics: Arc<Metrics>,
    pub started: Instant,
}

/// HTTP request logging middleware.
///
/// Logs each request in format: "IP METHOD PATH - STATUS"
async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "-".to_string());
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    let status = response.status();
    tracing::info!("{} {} {} - {}", peer, method, uri, status.as_u16());

    response
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(script::handle_root))
        .route("/{mac}/auto.ipxe", get(script::handle_auto_ipxe))
        .route("/ipxe/{*path}", get(ipxe::handle_binary))
        .route("/iso/{mac}/{name}", get(iso::handle_iso))
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics_text))
        .layer(middleware::from_fn(request_logging))
        .with_state(state)
}

async fn healthcheck(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "git_rev": option_env!("GIT_REV").unwrap_or("unknown"),
        "uptime_seconds": state.started.elapsed().as_secs(),
    });
    Json(body).into_response()
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
        .into_response()
}


#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::backend::MemoryBackend;

    use super::testutil::state_with_backend;
    use super::*;

    #[tokio::test]
    async fn healthcheck_returns_json() {
        let app = create_router(state_with_backend(MemoryBackend::new()));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/healthcheck")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json.get("git_rev").is_some());
        assert!(json.get("uptime_seconds").is_some());
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_exposition() {
        let state = state_with_backend(MemoryBackend::new());
        state.metrics.dhcp_packets.with_label_values(&["replied"]).inc();
        let app = create_router(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("dhcp_packets_total"));
    }
}
