//! Fallback forwarding: send requests the pipeline answered with 404 to the
//! configured base URL.
//!
//! The layer buffers the inbound body, runs the inner service, and only when
//! the result is a `404` that was not itself produced by a forward does it
//! replay the request against `base_url`. Bodies larger than the buffer
//! limit cannot be replayed; such requests reach the inner service unchanged
//! and its response is returned as is. A handler that deliberately answers
//! 404 is forwarded as well; the status code is the only signal available.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service};
use tracing::Instrument;

use super::forwarder::{is_handled, ForwardState, Forwarder};
use crate::error::ForwardError;
use crate::inbound::{buffer_body, Buffered, InboundRequest, RequestHead};
use crate::options::ForwardOptions;

/// Build the fallback layer.
///
/// `extra` is merged over the process defaults for every fallback forward.
/// Fails when no `base_url` is configured in the defaults, since there would
/// be nothing to forward to.
pub fn all(extra: ForwardOptions, state: ForwardState) -> Result<FallbackLayer, ForwardError> {
    if state.defaults.base_url.as_deref().filter(|b| !b.is_empty()).is_none() {
        return Err(ForwardError::invalid(
            "fallback forwarding requires `base_url` in the default options",
        ));
    }
    Ok(FallbackLayer {
        extra: Arc::new(extra),
        state,
    })
}

/// Tower layer installing [`FallbackService`]. Created by [`all`].
#[derive(Clone)]
pub struct FallbackLayer {
    extra: Arc<ForwardOptions>,
    state: ForwardState,
}

impl<S> Layer<S> for FallbackLayer {
    type Service = FallbackService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        FallbackService {
            inner,
            extra: self.extra.clone(),
            state: self.state.clone(),
        }
    }
}

/// Tower service that forwards 404 responses of the inner service to the base URL.
#[derive(Clone)]
pub struct FallbackService<S> {
    inner: S,
    extra: Arc<ForwardOptions>,
    state: ForwardState,
}

impl<S> Service<Request> for FallbackService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Clone-swap pattern (Tower Service contract).
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let extra = self.extra.clone();
        let state = self.state.clone();

        let span = forward_tracing::fallback_span!(req.method(), req.uri().path());
        Box::pin(
            async move {
                match run(inner, req, &extra, state).await {
                    Ok(response) => Ok(response),
                    Err(e) => Ok(e.into_response()),
                }
            }
            .instrument(span),
        )
    }
}

async fn run<S>(
    inner: S,
    req: Request,
    extra: &ForwardOptions,
    state: ForwardState,
) -> Result<Response, ForwardError>
where
    S: Service<Request, Response = Response, Error = Infallible>,
{
    let span = tracing::Span::current();
    let (parts, body) = req.into_parts();

    let bytes = match buffer_body(body, state.body_limit).await? {
        Buffered::Complete(bytes) => bytes,
        Buffered::Overflow(body) => {
            // Too large to replay: the local pipeline gets the request as-is.
            tracing::debug!(limit = state.body_limit, "Body exceeds buffer limit, fallback skipped");
            let response = call_inner(inner, Request::from_parts(parts, body)).await;
            span.record("pipeline_status", response.status().as_u16());
            span.record("forwarded", false);
            return Ok(response);
        }
    };
    let head = RequestHead::from_parts(&parts);

    let response = call_inner(inner, Request::from_parts(parts, Body::from(bytes.clone()))).await;
    span.record("pipeline_status", response.status().as_u16());

    if response.status() != StatusCode::NOT_FOUND || is_handled(&response) {
        span.record("forwarded", false);
        return Ok(response);
    }
    span.record("forwarded", true);

    let inbound = InboundRequest::parse(head, bytes).await?;
    let path = inbound.path.clone();
    tracing::debug!(path = %path, "No local handler, forwarding to base url");

    Forwarder::new(inbound, state).forward(&path, (*extra).clone()).await
}

async fn call_inner<S>(mut inner: S, req: Request) -> Response
where
    S: Service<Request, Response = Response, Error = Infallible>,
{
    match inner.call(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}
