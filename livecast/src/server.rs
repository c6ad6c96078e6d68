//! Server lifecycle management
//!
//! Builds the services once, serves HTTP and WebSocket signaling, and tears
//! everything down on SIGINT/SIGTERM. A dead media engine ends the process.

use std::sync::Arc;
use std::time::Duration;

use livecast_api::{create_router, AppState, SignalingContext};
use livecast_core::{Config, CredentialVerifier, JwtVerifier, LiveStore, MemoryLiveStore};
use livecast_sfu::{
    AuthorizationGate, EngineHealth, LocalEngine, MediaEngine, RoomNotifier, RoomRegistry,
    SeatRegistry,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Delay between engine death and process exit
const ENGINE_DEATH_GRACE: Duration = Duration::from_secs(2);
/// How long open connections get to finish after a shutdown signal
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Container for shared services
#[derive(Clone)]
pub struct Services {
    pub engine: LocalEngine,
    pub store: Arc<dyn LiveStore>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub registry: Arc<RoomRegistry>,
    pub gate: Arc<AuthorizationGate>,
}

impl Services {
    pub fn new(config: &Config) -> Self {
        let engine = LocalEngine::new(&config.engine);
        let store: Arc<dyn LiveStore> =
            Arc::new(MemoryLiveStore::new(config.seat.exclusive_by_default));
        let verifier: Arc<dyn CredentialVerifier> =
            Arc::new(JwtVerifier::from_config(&config.auth));
        let registry = Arc::new(RoomRegistry::new(
            Arc::clone(&store),
            RoomNotifier::with_capacity(config.server.outbound_buffer),
        ));
        let gate = Arc::new(AuthorizationGate::new(
            Arc::clone(&verifier),
            Arc::clone(&store),
            SeatRegistry::new(config.seat.ttl()),
            config.lives.auto_create,
        ));

        Self {
            engine,
            store,
            verifier,
            registry,
            gate,
        }
    }
}

/// Livecast server: owns the configuration and services for its lifetime
pub struct LivecastServer {
    config: Arc<Config>,
    services: Services,
}

impl LivecastServer {
    pub fn new(config: Config) -> Self {
        let services = Services::new(&config);
        Self {
            config: Arc::new(config),
            services,
        }
    }

    fn app_state(&self) -> AppState {
        let signaling = SignalingContext {
            engine: Arc::new(self.services.engine.clone()),
            registry: Arc::clone(&self.services.registry),
            gate: Arc::clone(&self.services.gate),
            audio_policy: self.config.signaling.audio_on_video_switch,
        };
        AppState {
            store: Arc::clone(&self.services.store),
            verifier: Arc::clone(&self.services.verifier),
            signaling: Arc::new(signaling),
            config: Arc::clone(&self.config),
        }
    }

    /// Serve until a shutdown signal arrives or the HTTP server stops
    pub async fn start(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watchdog = spawn_engine_watchdog(self.services.engine.health());
        let mut http_handle = self.start_http_server(shutdown_rx).await?;

        tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        let _ = shutdown_tx.send(true);
        self.shutdown();

        if tokio::time::timeout(HTTP_DRAIN_TIMEOUT, &mut http_handle)
            .await
            .is_err()
        {
            warn!(
                "HTTP server did not drain within {}s, aborting",
                HTTP_DRAIN_TIMEOUT.as_secs()
            );
            http_handle.abort();
        }
        watchdog.abort();

        info!("Livecast server stopped");
        Ok(())
    }

    /// Close every room so members get `liveEnded` and media handles are freed
    fn shutdown(&self) {
        let rooms = self.services.registry.close_all();
        info!(rooms, "Closed all rooms");
    }

    async fn start_http_server(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let http_addr: std::net::SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;
        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        let router = create_router(self.app_state());

        info!("HTTP server listening on {}", http_addr);

        Ok(tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        }))
    }
}

/// Exit the process shortly after the media engine dies
///
/// Router and transport state cannot be recovered once the engine is gone, so
/// the process exits and a supervisor restarts it.
fn spawn_engine_watchdog(mut health: watch::Receiver<EngineHealth>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let dead = match &*health.borrow_and_update() {
                EngineHealth::Dead(reason) => Some(reason.clone()),
                EngineHealth::Running => None,
            };
            if let Some(reason) = dead {
                error!(
                    reason = %reason,
                    "Media engine died, exiting in {}s",
                    ENGINE_DEATH_GRACE.as_secs()
                );
                break;
            }
            if health.changed().await.is_err() {
                return;
            }
        }

        tokio::time::sleep(ENGINE_DEATH_GRACE).await;
        std::process::exit(1);
    })
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
