//! Server lifecycle management
//!
//! Starts the HTTP/WebSocket server and the engine watchdog, then tears
//! everything down on a shutdown signal or when the media engine dies.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use sfumeet_core::Config;
use sfumeet_sfu::{LocalEngine, LocalEngineConfig, MediaEngine, RoomDirectory, SfuConfig};

/// Time given to in-flight work after the engine died
const ENGINE_DEATH_GRACE: Duration = Duration::from_secs(2);

/// `SfuMeet` server - owns the engine and the room directory
pub struct SfuMeetServer {
    config: Config,
    directory: Arc<RoomDirectory>,
}

impl SfuMeetServer {
    /// Build the media engine and the room directory from `config`
    #[must_use]
    pub fn new(config: Config) -> Self {
        let engine = Arc::new(LocalEngine::new(engine_config(&config)));
        let limits = SfuConfig {
            max_rooms: config.sfu.max_rooms,
            max_peers_per_room: config.sfu.max_peers_per_room,
            drop_empty_rooms: config.sfu.drop_empty_rooms,
        };
        let directory = RoomDirectory::new(engine as Arc<dyn MediaEngine>, limits);
        Self { config, directory }
    }

    /// Serve until a shutdown signal, or until the engine dies.
    ///
    /// Returns an error in the latter case so the process exits non-zero.
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting SfuMeet server...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut http_handle = self.start_http_server(shutdown_rx).await?;

        let watchdog = {
            let directory = Arc::clone(&self.directory);
            tokio::spawn(async move { directory.run_engine_watchdog().await })
        };

        tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = self.directory.shutdown_requested() => {
                info!("Room directory shut down");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }
        let engine_died = !self.directory.is_engine_alive();

        // Signal all components to shut down
        self.directory.shutdown();
        let _ = shutdown_tx.send(true);
        self.directory.close_all().await;
        if let Err(e) = watchdog.await {
            error!("Engine watchdog failed: {}", e);
        }

        if engine_died {
            error!(
                grace_secs = ENGINE_DEATH_GRACE.as_secs(),
                "Media engine worker died, routing state is lost; exiting"
            );
            tokio::time::sleep(ENGINE_DEATH_GRACE).await;
            anyhow::bail!("media engine worker died");
        }

        if !http_handle.is_finished() {
            if let Err(e) = http_handle.await {
                error!("HTTP server task failed: {}", e);
            }
        }
        info!("SfuMeet server stopped");
        Ok(())
    }

    /// Bind the HTTP listener and serve it with graceful shutdown support
    async fn start_http_server(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let http_router = sfumeet_api::http::create_router(
            Arc::clone(&self.directory),
            &self.config.server,
            self.config.signaling.clone(),
        );

        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
        info!(
            "HTTP server listening on {}, signaling at {}",
            http_address, self.config.server.ws_path
        );

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, http_router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

fn engine_config(config: &Config) -> LocalEngineConfig {
    let media = &config.media;
    LocalEngineConfig {
        listen_ip: media.listen_ip.clone(),
        announced_ip: config.announced_ip().to_string(),
        rtc_min_port: media.rtc_min_port,
        rtc_max_port: media.rtc_max_port,
        enable_udp: media.enable_udp,
        enable_tcp: media.enable_tcp,
        prefer_udp: media.prefer_udp,
        codecs: media.codecs.clone(),
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
