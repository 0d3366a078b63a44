//! vmpod server entry point.

use anyhow::Context;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmpod_core::ProviderRegistry;
use vmpod_server::{http, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("vmpod_server=info".parse()?)
                .add_directive("vmpod_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting vmpod server");

    let config = ServerConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    let registry = ProviderRegistry::with_builtin();
    let provider = registry
        .construct(&config.provider, &config.backend_config)
        .with_context(|| format!("constructing provider {:?}", config.provider))?;

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let http_provider = provider.clone();
    let http_addr = config.http_addr;
    let mut http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };
        http::serve(http_provider, http_addr, shutdown).await
    });

    tracing::info!(http_addr = %config.http_addr, provider = %config.provider, "Server ready");

    let finished = tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            tracing::info!("Received shutdown signal, cleaning up...");
            None
        }
        result = &mut http_handle => Some(result),
    };
    let served = match finished {
        Some(result) => {
            tracing::error!("HTTP server exited unexpectedly");
            result
        }
        None => {
            // Stop taking requests and let in-flight ones finish before
            // tearing sandboxes down
            let _ = shutdown_tx.send(());
            http_handle.await
        }
    };
    if let Err(e) = served.context("HTTP server task panicked")? {
        tracing::error!(error = %e, "HTTP server error");
    }

    // Destroy all managed sandboxes
    if let Err(e) = provider.shutdown().await {
        tracing::error!(error = %e, "Error during sandbox cleanup");
    } else {
        tracing::info!("All sandboxes cleaned up");
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}
