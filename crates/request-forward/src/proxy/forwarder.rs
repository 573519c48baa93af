//! The per-request forward capability.
//!
//! A [`Forwarder`] is extracted from the inbound request, resolves outbound
//! options against the process defaults, and streams the upstream response
//! back verbatim. Responses it produces carry the [`Handled`] marker.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{FromRef, FromRequest, Request};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::Instrument;

use super::correlation::{self, CORRELATION_HEADER};
use crate::error::ForwardError;
use crate::inbound::InboundRequest;
use crate::options::{self, DefaultOptions, FormPart, ForwardOptions, OutboundBody};

/// Headers that are never forwarded in either direction (hop-by-hop headers).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

/// Response extension marking a response as written by the forwarder.
///
/// Middleware that would otherwise produce its own response (the fallback
/// layer) must leave responses carrying this marker alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handled;

/// Whether `response` was produced by a forward.
pub fn is_handled(response: &Response) -> bool {
    response.extensions().get::<Handled>().is_some()
}

/// Shared, read-only state every forward needs.
#[derive(Clone)]
pub struct ForwardState {
    pub client: reqwest::Client,
    pub defaults: Arc<DefaultOptions>,
    /// Maximum inbound body size buffered before forwarding.
    pub body_limit: usize,
}

impl ForwardState {
    pub fn new(client: reqwest::Client, defaults: DefaultOptions, body_limit: usize) -> Self {
        Self {
            client,
            defaults: Arc::new(defaults),
            body_limit,
        }
    }
}

/// Forward capability bound to one inbound request.
pub struct Forwarder {
    inbound: InboundRequest,
    state: ForwardState,
}

impl<S> FromRequest<S> for Forwarder
where
    ForwardState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ForwardError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let state = ForwardState::from_ref(state);
        let inbound = InboundRequest::from_request(req, state.body_limit).await?;
        Ok(Self::new(inbound, state))
    }
}

impl Forwarder {
    pub fn new(inbound: InboundRequest, state: ForwardState) -> Self {
        Self { inbound, state }
    }

    /// The inbound request this forwarder was built from.
    pub fn inbound(&self) -> &InboundRequest {
        &self.inbound
    }

    /// Forward the inbound request to `target` (absolute URL or path) and relay
    /// the upstream response.
    ///
    /// An unreachable target yields a `404` with an empty body. Other transport
    /// failures are returned as [`ForwardError::Transport`].
    pub async fn forward(
        self,
        target: &str,
        options: ForwardOptions,
    ) -> Result<Response, ForwardError> {
        let resolved = options::resolve(&self.inbound, target, options, &self.state.defaults)?;
        // Spooled uploads stay on disk until the upstream has answered.
        let response = dispatch(&self.state.client, resolved).await;
        drop(self.inbound);
        response
    }
}

/// Send resolved options upstream and build the relayed response.
pub(crate) async fn dispatch(
    client: &reqwest::Client,
    options: ForwardOptions,
) -> Result<Response, ForwardError> {
    let correlation_id = correlation::generate_id();
    let url = options.target_url()?;
    let method = options.method.clone().unwrap_or_default();

    let span = forward_tracing::forward_request_span!(&correlation_id, &method, &url);
    let start = Instant::now();

    async {
        if options.debug {
            tracing::info!(options = ?options, "forward options");
        }

        let mut req_builder = client.request(method, url);
        if let Some(headers) = options.headers.as_ref() {
            req_builder = req_builder.headers(forwardable_headers(headers));
        }
        req_builder = req_builder.header(CORRELATION_HEADER, &correlation_id);

        req_builder = match options.body {
            Some(OutboundBody::Raw(bytes)) => req_builder.body(bytes),
            Some(OutboundBody::Json(value)) => req_builder.json(&value),
            Some(OutboundBody::Form(fields)) => req_builder.form(&fields),
            Some(OutboundBody::Multipart(parts)) => req_builder.multipart(multipart_form(parts).await?),
            None => req_builder,
        };

        let upstream_result = req_builder.send().await;
        let latency = start.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency);

        let upstream_resp = match upstream_result {
            Ok(resp) => resp,
            Err(e) => match ForwardError::from_transport(e) {
                ForwardError::TargetUnreachable(e) => {
                    tracing::Span::current().record("status", 404_u16);
                    tracing::warn!(error = %e, "Forward target unreachable");
                    return Ok(not_found());
                }
                other => {
                    tracing::error!(error = %other, latency_ms = latency, "Forward failed");
                    return Err(other);
                }
            },
        };

        Ok::<_, ForwardError>(build_response(upstream_resp, &correlation_id, latency))
    }
    .instrument(span)
    .await
}

/// Copy headers, dropping hop-by-hop ones, any stale correlation id and
/// `content-length` (reqwest sets it from the body actually sent).
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str)
            || name_str == CORRELATION_HEADER
            || *name == header::CONTENT_LENGTH
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Open every file part as a stream. Files are closed when the form is dropped.
async fn multipart_form(
    parts: Vec<(String, FormPart)>,
) -> Result<reqwest::multipart::Form, ForwardError> {
    let mut form = reqwest::multipart::Form::new();
    for (name, part) in parts {
        form = match part {
            FormPart::Text(value) => form.text(name, value),
            FormPart::File(file) => {
                let handle = tokio::fs::File::open(&file.path).await?;
                let len = handle.metadata().await?.len();
                let mut stream =
                    reqwest::multipart::Part::stream_with_length(reqwest::Body::from(handle), len);
                if let Some(filename) = file.filename {
                    stream = stream.file_name(filename);
                }
                if let Some(content_type) = file.content_type.as_deref() {
                    stream = stream.mime_str(content_type).map_err(|e| {
                        ForwardError::invalid(format!("invalid media type `{content_type}`: {e}"))
                    })?;
                }
                form.part(name, stream)
            }
        };
    }
    Ok(form)
}

fn handled(mut response: Response) -> Response {
    response.extensions_mut().insert(Handled);
    response
}

fn not_found() -> Response {
    handled(StatusCode::NOT_FOUND.into_response())
}

/// Build an axum Response from the upstream response, streaming the body back.
fn build_response(upstream_resp: reqwest::Response, correlation_id: &str, latency: u64) -> Response {
    let status = upstream_resp.status();
    tracing::Span::current().record("status", status.as_u16());
    tracing::info!(status = status.as_u16(), latency_ms = latency, "Forward complete");

    let mut response_builder = Response::builder().status(status);

    for (name, value) in upstream_resp.headers().iter() {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        response_builder = response_builder.header(name, value);
    }

    response_builder = response_builder.header(
        CORRELATION_HEADER,
        HeaderValue::from_str(correlation_id).unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    );

    let body = Body::from_stream(upstream_resp.bytes_stream());

    response_builder
        .body(body)
        .map(handled)
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to build response");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        })
}
