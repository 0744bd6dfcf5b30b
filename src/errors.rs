use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

/// The closed set of failures the gateway can surface to a caller.
///
/// Every other error (reqwest, serde, lock poisoning) is folded into one of
/// these at the boundary where it crosses into the request pipeline — the
/// rest of the crate never hands back an ad-hoc `String` or HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited { retry_after_ms: u64 },
    #[error("tier saturated")]
    TierSaturated,
    #[error("chain not supported: {0}")]
    ChainUnsupported(String),
    #[error("circuit breaker open")]
    BreakerOpen,
    #[error("all upstream endpoints failed: {0}")]
    UpstreamFailed(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::Unauthorized => "UNAUTHORIZED",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::TierSaturated => "TIER_SATURATED",
            GatewayError::ChainUnsupported(_) => "CHAIN_UNSUPPORTED",
            GatewayError::BreakerOpen => "BREAKER_OPEN",
            GatewayError::UpstreamFailed(_) => "UPSTREAM_FAILED",
            GatewayError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::TierSaturated => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ChainUnsupported(_) => StatusCode::NOT_FOUND,
            GatewayError::BreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn data(&self) -> Option<serde_json::Value> {
        match self {
            GatewayError::RateLimited { retry_after_ms } => {
                Some(serde_json::json!({ "retry_after_ms": retry_after_ms }))
            }
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

impl GatewayError {
    /// Builds the `{ error: {...}, chain, request_id }` envelope from §6 with
    /// the caller's request context. Used wherever the chain/request id are
    /// already known; `into_response` (no context) is the fallback for
    /// errors raised before that context exists.
    pub fn into_response_with_context(self, chain: Option<String>, request_id: Option<String>) -> Response {
        let status = self.status();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
                data: self.data(),
            },
            chain,
            request_id,
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
                data: self.data(),
            },
            chain: None,
            request_id: None,
        };
        (status, Json(body)).into_response()
    }
}
