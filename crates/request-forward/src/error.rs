//! Error type shared by the resolver, the forwarder and the fallback layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors produced while preparing or issuing a forward.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Bad call-site input: empty or malformed target, missing base URL.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The outbound connection could not be established (DNS failure or refusal).
    #[error("target unreachable: {0}")]
    TargetUnreachable(#[source] reqwest::Error),

    /// Any other outbound transport failure.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// The inbound body could not be read or parsed.
    #[error("invalid request body: {0}")]
    Body(String),

    /// The inbound body is larger than the configured buffer limit.
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// A file spooled for a multipart upload could not be written or reopened.
    #[error("upload file error: {0}")]
    Upload(#[from] std::io::Error),
}

impl ForwardError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ForwardError::InvalidArgument(msg.into())
    }

    /// Classify an outbound error: connect failures are recoverable, the rest are not.
    pub(crate) fn from_transport(e: reqwest::Error) -> Self {
        if e.is_connect() {
            ForwardError::TargetUnreachable(e)
        } else {
            ForwardError::Transport(e)
        }
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        match &self {
            ForwardError::TargetUnreachable(_) => StatusCode::NOT_FOUND.into_response(),
            ForwardError::Body(msg) => {
                tracing::warn!(error = %msg, "Rejecting unreadable request body");
                (StatusCode::BAD_REQUEST, "invalid request body").into_response()
            }
            ForwardError::PayloadTooLarge { limit } => {
                tracing::warn!(limit = *limit, "Rejecting oversized request body");
                (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response()
            }
            ForwardError::Transport(e) => {
                tracing::error!(error = %e, "Upstream transport error");
                (StatusCode::BAD_GATEWAY, "upstream transport error").into_response()
            }
            ForwardError::InvalidArgument(_) | ForwardError::Upload(_) => {
                tracing::error!(error = %self, "Forward failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}
