//! Single typed representation of every rejection path, so the HTTP
//! response and the structured log line are built from one value instead
//! of ad hoc `(StatusCode, String)` tuples scattered across call sites.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("either prompt or media_url must be provided")]
    Validation,

    #[error("insufficient free RAM: {free_mb}MB available")]
    LowMemory { free_mb: u64 },

    #[error("prompt exceeds {max} characters")]
    PromptTooLong { max: usize },

    #[error("prompt exceeds token ceiling for product '{product}' ({estimated}>{ceiling})")]
    TokenCeilingExceeded {
        product: String,
        estimated: u64,
        ceiling: u64,
    },

    #[error("media_url is required for media route")]
    MediaUrlRequired,

    #[error("fast text provider cooldown active")]
    BreakerOpen { retry_after_secs: u64 },

    #[error("global request timeout reached")]
    DeadlineExceeded,

    #[error("all providers failed for this request")]
    AllProvidersFailed,
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation | Self::MediaUrlRequired => StatusCode::UNPROCESSABLE_ENTITY,
            Self::LowMemory { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::PromptTooLong { .. } | Self::TokenCeilingExceeded { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            Self::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::AllProvidersFailed => StatusCode::BAD_GATEWAY,
        };
        let body = Json(json!({ "detail": self.to_string() }));
        let mut response = (status, body).into_response();
        if let Self::BreakerOpen { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.max(1).to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}
