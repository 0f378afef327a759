//! HTTP edge routes: chat-completion endpoints, health, and metrics.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{stream, StreamExt};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::LlmError;
use crate::model::CompletionRequest;
use crate::pipeline::{CallerContext, Pipeline};
use crate::providers::manager::ProviderManager;
use crate::routing::RoutingEngine;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    /// The wired request pipeline.
    pub pipeline: Arc<Pipeline>,
    /// Provider manager, consulted directly by `/health`.
    pub manager: Arc<ProviderManager>,
    /// Routing engine, consulted directly by `/metrics`.
    pub routing: Arc<RoutingEngine>,
}

/// Build the axum router exposing the proxy's public surface.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/realtime", get(websocket_not_implemented))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn caller_from_headers(headers: &HeaderMap) -> CallerContext {
    let user = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_owned();
    let api_key_id = headers
        .get("x-api-key-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_owned();
    let session_id = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);
    let preferred_provider = headers
        .get("x-preferred-provider")
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    CallerContext {
        user,
        api_key_id,
        session_id,
        preferred_provider,
    }
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> Response {
    let caller = caller_from_headers(&headers);
    if request.stream {
        return stream_response(state, request, caller).await;
    }

    match state.pipeline.handle_completion(request, caller).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> Response {
    chat_completions(State(state), headers, Json(request)).await
}

async fn stream_response(state: AppState, request: CompletionRequest, caller: CallerContext) -> Response {
    match state.pipeline.handle_stream(request, caller).await {
        Ok(rx) => {
            let chunks = ReceiverStream::new(rx).map(|chunk| {
                let payload = serde_json::to_string(&chunk).unwrap_or_default();
                Ok::<_, std::convert::Infallible>(Event::default().data(payload))
            });
            let done = stream::once(async { Ok(Event::default().data("[DONE]")) });
            let stream = chunks.chain(done);
            Sse::new(stream)
                .keep_alive(axum::response::sse::KeepAlive::default())
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let summary = state.manager.health_summary();
    let status = if summary.healthy == 0 && summary.total > 0 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ok" } else { "degraded" },
            "providers": {
                "total": summary.total,
                "healthy": summary.healthy,
                "unhealthy": summary.unhealthy,
            },
        })),
    )
        .into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    let routing = state.routing.stats();
    let summary = state.manager.health_summary();

    let body = format!(
        "# HELP llmproxy_routing_requests_total Total routing decisions made.\n\
         # TYPE llmproxy_routing_requests_total counter\n\
         llmproxy_routing_requests_total {}\n\
         # HELP llmproxy_routing_policy_override_total Decisions resolved by policy override.\n\
         # TYPE llmproxy_routing_policy_override_total counter\n\
         llmproxy_routing_policy_override_total {}\n\
         # HELP llmproxy_routing_manual_override_total Decisions resolved by manual override.\n\
         # TYPE llmproxy_routing_manual_override_total counter\n\
         llmproxy_routing_manual_override_total {}\n\
         # HELP llmproxy_routing_errors_total Routing errors encountered.\n\
         # TYPE llmproxy_routing_errors_total counter\n\
         llmproxy_routing_errors_total {}\n\
         # HELP llmproxy_providers_healthy Providers currently healthy.\n\
         # TYPE llmproxy_providers_healthy gauge\n\
         llmproxy_providers_healthy {}\n\
         # HELP llmproxy_providers_total Providers registered.\n\
         # TYPE llmproxy_providers_total gauge\n\
         llmproxy_providers_total {}\n",
        routing.total_requests,
        routing.policy_override,
        routing.manual_override,
        routing.errors,
        summary.healthy,
        summary.total,
    );

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn websocket_not_implemented() -> Response {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({
            "error": {
                "message": "WebSocket support is not implemented",
                "type": "not_found",
                "code": "not_implemented",
            }
        })),
    )
        .into_response()
}

fn error_response(error: &LlmError) -> Response {
    let status = match error {
        LlmError::Validation { .. } | LlmError::ModelNotSupported { .. } => StatusCode::BAD_REQUEST,
        // Upstream auth failures are the provider's fault, not the caller's.
        LlmError::Auth { .. } => StatusCode::BAD_GATEWAY,
        LlmError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
        LlmError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        LlmError::ModelNotFound { .. } | LlmError::ProviderNotFound(_) => StatusCode::NOT_FOUND,
        LlmError::NoHealthyProviders | LlmError::AllProvidersFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    warn!(error = %error, status = %status, "request failed");

    let kind = match error {
        LlmError::Auth { .. } => "provider_error",
        other => other.kind_label(),
    };

    (
        status,
        Json(json!({
            "error": {
                "message": error.to_string(),
                "type": kind,
            }
        })),
    )
        .into_response()
}
