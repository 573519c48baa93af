//! Axum HTTP server: demo router, listener, graceful shutdown.

use std::sync::Arc;

use axum::extract::{FromRef, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::config::ForwardConfig;
use crate::error::ForwardError;
use crate::inbound::{InboundRequest, ParsedBody};
use crate::options::ForwardOptions;
use crate::proxy::fallback;
use crate::proxy::forwarder::{ForwardState, Forwarder};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ForwardConfig,
    pub forward: ForwardState,
}

impl AppState {
    pub fn new(config: ForwardConfig, client: reqwest::Client) -> Self {
        let forward = ForwardState::new(
            client,
            config.defaults.clone(),
            config.server.body_limit_bytes,
        );
        Self { config, forward }
    }
}

impl FromRef<Arc<AppState>> for ForwardState {
    fn from_ref(state: &Arc<AppState>) -> Self {
        state.forward.clone()
    }
}

/// Build the demo router.
///
/// `POST /` forwards to `POST /test`, which echoes the parsed body back. When
/// fallback is enabled, every request no route answers is forwarded to
/// `defaults.base_url`.
pub fn router(state: AppState) -> Result<Router, ForwardError> {
    let fallback_layer = if state.config.fallback.enabled {
        Some(fallback::all(ForwardOptions::new(), state.forward.clone())?)
    } else {
        None
    };

    let app = Router::new()
        .route("/", post(handle_forward))
        .route("/test", post(handle_echo))
        .route("/health", get(handle_health))
        .with_state(Arc::new(state));

    let app = match fallback_layer {
        Some(layer) => app.layer(layer),
        None => app,
    };
    Ok(app.layer(TraceLayer::new_for_http()))
}

/// Build and run the HTTP server.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let listen_addr = state.config.server.listen_address.clone();
    let app = router(state)?;

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "request-forward listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("request-forward shut down gracefully");
    Ok(())
}

/// Forward `POST /` to `/test` on the same host.
async fn handle_forward(forwarder: Forwarder) -> Result<Response, ForwardError> {
    tracing::debug!(
        method = %forwarder.inbound().method,
        content_kind = ?forwarder.inbound().content_kind,
        "Forwarding to /test"
    );
    forwarder.forward("/test", ForwardOptions::new()).await
}

/// Echo the parsed request body.
///
/// JSON comes back as sent, form fields as a JSON object, multipart bodies as
/// their fields plus file metadata, anything else byte for byte.
async fn handle_echo(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, ForwardError> {
    let inbound = InboundRequest::from_request(request, state.forward.body_limit).await?;

    let response = match inbound.body {
        ParsedBody::Json(value) => Json(value).into_response(),
        ParsedBody::UrlEncoded(fields) => Json(fields_object(&fields)).into_response(),
        ParsedBody::Multipart(multipart) => {
            let mut files = serde_json::Map::new();
            for (name, entry) in &multipart.files {
                let mut described = Vec::new();
                for f in entry.iter() {
                    let size = tokio::fs::metadata(&f.path).await?.len();
                    described.push(json!({
                        "filename": f.filename,
                        "content_type": f.content_type,
                        "size": size,
                    }));
                }
                files.insert(name.clone(), serde_json::Value::Array(described));
            }
            Json(json!({
                "fields": fields_object(&multipart.fields),
                "files": files,
            }))
            .into_response()
        }
        ParsedBody::Raw(bytes) => bytes.into_response(),
        ParsedBody::Absent => StatusCode::NO_CONTENT.into_response(),
    };
    Ok(response)
}

fn fields_object(fields: &[(String, String)]) -> serde_json::Value {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

/// Health check endpoint.
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Wait for SIGINT (Ctrl+C) for graceful shutdown.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C signal handler");
        return std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining connections...");
}
