//! HTTP surface: `POST /infer` routes a request through the pipeline,
//! `GET /health` reports store/memory/breaker status. Each request runs
//! under the router's own global deadline (§5), enforced here rather than
//! per-stage so cache hits and coalesced waits share one clock.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;

use crate::dispatcher::{new_request_id, RouterCore};
use crate::domain::InferRequest;
use crate::errors::RouterError;
use crate::observability::RouterEvent;

#[derive(Clone)]
pub struct GatewayState {
    pub core: Arc<RouterCore>,
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_request_id)
}

/// Mirrors the original service's request-logging middleware: honors an
/// incoming `x-request-id` or mints one, and echoes it on every response
/// regardless of which handler or error path produced it.
async fn echo_request_id(headers: HeaderMap, mut request: Request, next: Next) -> Response {
    let request_id = extract_request_id(&headers);
    request.extensions_mut().insert(RequestId(request_id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[derive(Clone)]
struct RequestId(String);

async fn handle_infer(
    State(state): State<GatewayState>,
    axum::Extension(RequestId(request_id)): axum::Extension<RequestId>,
    Json(body): Json<InferRequest>,
) -> Response {
    let global_timeout = state.core.config.global_timeout;

    let outcome = tokio::time::timeout(global_timeout, state.core.route(body, request_id.clone())).await;

    match outcome {
        Ok(Ok(response)) => {
            tracing::info!(event = RouterEvent::ResponseWritten.as_str(), request_id = %request_id);
            Json(response).into_response()
        }
        Ok(Err(error)) => error.into_response(),
        Err(_) => {
            tracing::warn!(event = RouterEvent::DeadlineExceeded.as_str(), request_id = %request_id);
            RouterError::DeadlineExceeded.into_response()
        }
    }
}

async fn handle_health(State(state): State<GatewayState>) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(state.core.health().await))
}

pub fn router(core: Arc<RouterCore>) -> Router {
    Router::new()
        .route("/infer", post(handle_infer))
        .route("/health", get(handle_health))
        .layer(middleware::from_fn(echo_request_id))
        .with_state(GatewayState { core })
}

/// Binds and serves, draining in-flight requests on SIGINT/SIGTERM before
/// exiting.
pub async fn run_http(core: Arc<RouterCore>) -> Result<()> {
    let bind_addr = core.config.bind_addr.clone();
    let app = router(core);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind_addr = %bind_addr, "inference router listening (Ctrl+C/SIGTERM to stop)");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("inference router stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
