//! appmesh-inject - App Mesh proxy injector for Kubernetes pods.
//!
//! This is the main entry point that:
//! - Parses and validates the server configuration
//! - Initializes structured logging
//! - Creates the Kubernetes client
//! - Serves the admission webhook until SIGTERM/SIGINT

use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use clap::Parser;
use kube::Client;
use tokio::signal;
use tracing::{error, info};

use appmesh_inject::webhooks::KubeReplicaSets;
use appmesh_inject::{HealthState, ServerConfig, WebhookState, run_webhook_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("appmesh_inject=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .json()
        .init();

    config.validate()?;
    info!(
        mesh = %config.mesh_name,
        region = %config.region,
        port = config.port,
        dev = config.dev,
        inject_default = config.inject_default,
        tracing = ?config.tracing_backend().as_ref().map(|t| t.name()),
        "Starting appmesh-inject"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let config = Arc::new(config);
    let health_state = Arc::new(HealthState::new());
    let state = Arc::new(WebhookState::new(
        config.clone(),
        Arc::new(KubeReplicaSets::new(client)),
        health_state.clone(),
    ));

    let handle = Handle::new();
    let mut server = tokio::spawn(run_webhook_server(state, handle.clone()));

    // Ready once the listener is bound
    {
        let handle = handle.clone();
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Some(addr) = handle.listening().await {
                info!(%addr, "Webhook server ready");
                health_state.set_ready(true).await;
            }
        });
    }

    tokio::select! {
        result = &mut server => {
            match result {
                Ok(Ok(())) => info!("Webhook server stopped"),
                Ok(Err(e)) => {
                    error!(error = %e, "Webhook server error");
                    return Err(e.into());
                }
                Err(e) => error!("Webhook server task panicked: {}", e),
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Stop receiving new admission requests
            health_state.set_ready(false).await;

            let timeout = Duration::from_secs(config.shutdown_timeout_secs);
            info!(timeout_secs = config.shutdown_timeout_secs, "Waiting for in-flight requests to complete...");
            handle.graceful_shutdown(Some(timeout));

            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Webhook server error during shutdown"),
                Err(e) => error!("Webhook server task panicked: {}", e),
            }
        }
    }

    info!("Injector stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Signal handler setup failures are fatal; the server cannot shut down
/// gracefully without them.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
