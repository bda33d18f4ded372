//! audio-harness-server: gRPC front end for host audio capture.
//!
//! Serves device enumeration and shared capture streaming on a single port.
//! All state lives in the session manager; shutting down closes every open
//! capture line before the process exits.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_harness::backend::cpal_backend::CpalBackend;
use audio_harness::capture::CaptureOptions;
use audio_harness::registry::AudioDeviceRegistry;
use audio_harness::server::AudioHarnessService;
use audio_harness::session::CaptureSessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let backend = Arc::new(CpalBackend::new());
    let registry = Arc::new(AudioDeviceRegistry::new(backend.clone()));
    let sessions = Arc::new(CaptureSessionManager::new(
        backend,
        CaptureOptions::default(),
    ));

    let devices = registry.list_devices();
    info!("Host reports {} audio devices:", devices.len());
    for device in &devices {
        info!("  {} {:?}", device.name, device.capabilities);
    }

    let addr: SocketAddr = std::env::var("AUDIO_HARNESS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:50051".to_string())
        .parse()
        .context("Invalid AUDIO_HARNESS_ADDR")?;

    info!("Starting gRPC server on {}", addr);

    let service = AudioHarnessService::new(registry, sessions.clone());
    Server::builder()
        .add_service(service.server())
        .serve_with_shutdown(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received, closing capture sessions");
        })
        .await
        .context("gRPC server failed")?;

    sessions.shutdown().await;
    Ok(())
}
