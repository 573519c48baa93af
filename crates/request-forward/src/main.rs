//! request-forward: demo server forwarding requests with the forward helper.

use request_forward::config::ForwardConfig;
use request_forward::server::{self, AppState};

fn main() -> anyhow::Result<()> {
    let config_path = {
        let args: Vec<String> = std::env::args().collect();
        args.iter()
            .position(|a| a == "--config")
            .and_then(|i| args.get(i + 1).cloned())
            .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
            .or_else(|| std::env::var("FORWARD_CONFIG").ok())
            .unwrap_or_else(|| "request-forward.toml".to_string())
    };

    let config = ForwardConfig::load(&config_path)?;

    // Build the tokio runtime first: the tonic gRPC exporter needs a reactor context
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let tracing_guard = forward_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            base_url = ?config.defaults.base_url,
            fallback = config.fallback.enabled,
            debug = config.defaults.debug,
            otlp = tracing_guard.exporting(),
            "Starting request-forward"
        );

        // No client-level timeout: forwards wait as long as the transport allows.
        let client = reqwest::Client::builder().build()?;
        let result = server::run(AppState::new(config, client)).await;
        drop(tracing_guard);
        result
    })
}
