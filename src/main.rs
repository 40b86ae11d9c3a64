//! branchlm server entry point.
//!
//! Startup order:
//! 1. Load settings (file, then `BRANCHLM_*` overrides).
//! 2. Initialise tracing.
//! 3. Start the llama worker and load the model.
//! 4. Serve HTTP until Ctrl-C / SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use branchlm::inference::{is_gguf_file, LlamaEngine, LoadOptions};
use branchlm::server::{self, AppState};
use branchlm::storage::load_settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = load_settings();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|e| {
            eprintln!(
                "WARN: log_level '{}' is not a valid filter ({}); falling back to 'info'",
                settings.log_level, e
            );
            EnvFilter::new("info")
        });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting branchlm v{}", env!("CARGO_PKG_VERSION"));

    if !is_gguf_file(&settings.model_path) {
        bail!(
            "model_path {} is not a readable .gguf file (set BRANCHLM_MODEL)",
            settings.model_path.display()
        );
    }

    let mut engine = LlamaEngine::new();
    engine.init()?;
    let model_info = engine
        .load_model(
            &settings.model_path,
            LoadOptions {
                gpu_layers: settings.gpu_layers,
                context_size: settings.context_size,
                batch_size: settings.batch_size,
            },
        )
        .with_context(|| format!("loading {}", settings.model_path.display()))?;
    info!(
        model = %model_info.path,
        context_size = model_info.context_size,
        size_bytes = model_info.size_bytes,
        "Model ready"
    );

    let addr: SocketAddr = settings
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind_address {}", settings.bind_address))?;

    let state = Arc::new(AppState::new(settings, Arc::new(engine)));
    let app = server::build(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("branchlm stopped");
    Ok(())
}

/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl-C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}
