//! Server lifecycle
//!
//! Wires the SFU, the signaling hub and the HTTP router together, serves until
//! a shutdown signal arrives, then tears everything down in order.

use std::sync::Arc;

use roomcast_sfu::{SfuManager, WebRtcEngine};
use roomcast_signaling::{create_router, AppState, Hub, HubHandle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;

pub struct RoomcastServer {
    config: Config,
    sfu: Arc<SfuManager<WebRtcEngine>>,
    hub: HubHandle,
    hub_task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl RoomcastServer {
    /// Build the SFU and start the hub
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let engine = WebRtcEngine::new(&config.sfu)
            .map_err(|e| anyhow::anyhow!("Failed to initialize media engine: {e}"))?;
        let sfu = Arc::new(SfuManager::new(engine, config.sfu.clone()));

        let shutdown = CancellationToken::new();
        let (hub, hub_task) = Hub::spawn(sfu.clone(), &config.signaling, shutdown.child_token());

        Ok(Self {
            config,
            sfu,
            hub,
            hub_task,
            shutdown,
        })
    }

    /// Serve HTTP until Ctrl+C/SIGTERM, then shut down gracefully
    pub async fn start(self) -> anyhow::Result<()> {
        let http_address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
        info!("HTTP server listening on {}", http_address);

        let router = create_router(AppState {
            hub: self.hub.clone(),
            backend: self.sfu.clone(),
            config: Arc::new(self.config.signaling.clone()),
        });

        let shutdown = self.shutdown.clone();
        let http_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                error!("HTTP server error: {}", e);
            }
            info!("HTTP server shut down gracefully");
        });

        tokio::select! {
            _ = http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(self) {
        info!("Shutting down roomcast...");

        // Stop accepting connections and close every client
        self.shutdown.cancel();
        if let Err(e) = self.hub_task.await {
            error!("Hub task failed: {}", e);
        }

        let stats = self.sfu.stats().await;
        info!(
            rooms = stats.active_rooms,
            subscribers = stats.subscribers,
            packets_relayed = stats.packets_relayed,
            "Closing SFU rooms"
        );
        self.sfu.shutdown().await;

        info!("Shutdown complete");
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
