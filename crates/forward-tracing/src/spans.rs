//! Span builder helpers for request-forward instrumentation.

/// Create a tracing span for one forward call.
///
/// Usage: `let span = forward_request_span!(correlation_id, method, url);`
///
/// `status` and `latency_ms` are recorded once the upstream answers (or fails).
#[macro_export]
macro_rules! forward_request_span {
    ($correlation_id:expr, $method:expr, $url:expr) => {
        tracing::info_span!(
            "forward_request",
            correlation_id = %$correlation_id,
            method = %$method,
            url = %$url,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for the fallback middleware around one request.
///
/// `forwarded` is recorded as `true` when the pipeline answered 404 and the
/// request was sent on to the base URL.
#[macro_export]
macro_rules! fallback_span {
    ($method:expr, $path:expr) => {
        tracing::info_span!(
            "forward_fallback",
            method = %$method,
            path = %$path,
            pipeline_status = tracing::field::Empty,
            forwarded = tracing::field::Empty,
        )
    };
}
