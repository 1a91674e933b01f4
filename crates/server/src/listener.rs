use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use quinn::{Connection, Endpoint, VarInt};
use tokio::select;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Server;
use crate::session::{handle_connection, Ingestor, SessionManager};
use crate::store::Persistence;

const RETENTION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// QUIC listener that accepts telemetry connections and feeds them into the store.
pub struct Collector {
    endpoint: Endpoint,
    sessions: SessionManager<Connection>,
    store: Arc<dyn Persistence>,
    sweep_interval: Duration,
    retention: chrono::Duration,
    shutdown_timeout: Duration,
}

impl Collector {
    pub fn bind(settings: &Server, store: Arc<dyn Persistence>) -> Result<Self> {
        let listen_addr: SocketAddr = settings
            .listen_addr()
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", settings.listen_addr()))?;
        let endpoint = Endpoint::server(shared::tls::server_config()?, listen_addr)
            .with_context(|| format!("Failed to listen on '{}'", listen_addr))?;

        Ok(Self {
            endpoint,
            sessions: SessionManager::new(settings.client_timeout()),
            store,
            sweep_interval: settings.sweep_interval(),
            retention: settings.retention(),
            shutdown_timeout: settings.shutdown_timeout(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn sessions(&self) -> SessionManager<Connection> {
        self.sessions.clone()
    }

    /// Serves until `shutdown` is cancelled, then drains connection handlers.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();
        let ingestor = Arc::new(Ingestor::new(self.sessions.clone(), self.store.clone()));

        tracker.spawn(sweep_sessions(self.sessions.clone(), self.sweep_interval, shutdown.clone()));
        tracker.spawn(purge_samples(self.store.clone(), self.retention, shutdown.clone()));

        info!("Listening on: {}", self.local_addr()?);
        loop {
            let incoming = select! {
                _ = shutdown.cancelled() => break,
                incoming = self.endpoint.accept() => incoming,
            };
            let Some(incoming) = incoming else {
                warn!("Endpoint closed; no longer accepting connections");
                break;
            };

            let ingestor = ingestor.clone();
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                match incoming.await {
                    Ok(connection) => handle_connection(connection, ingestor, shutdown).await,
                    Err(err) => debug!("Handshake failed: {}", err),
                }
            });
        }

        debug!("shutdown starting; closing {} sessions", self.sessions.session_count());
        shutdown.cancel();
        self.endpoint.set_server_config(None);
        self.sessions.close_all("server shutdown");

        tracker.close();
        if tokio::time::timeout(self.shutdown_timeout, tracker.wait()).await.is_err() {
            warn!(
                "{} connection handlers still running after {:?}; stopping anyway",
                tracker.len(),
                self.shutdown_timeout
            );
        }

        self.endpoint.close(VarInt::from_u32(0), b"server shutdown");
        if tokio::time::timeout(self.shutdown_timeout, self.endpoint.wait_idle()).await.is_err() {
            warn!("Endpoint did not go idle within {:?}", self.shutdown_timeout);
        }
        debug!("shutdown finished");
        Ok(())
    }
}

async fn sweep_sessions(sessions: SessionManager<Connection>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = sessions.cleanup_timeout_sessions(Instant::now());
                if evicted > 0 {
                    info!("Evicted {} idle client sessions", evicted);
                }
            }
        }
    }
}

async fn purge_samples(store: Arc<dyn Persistence>, retention: chrono::Duration, shutdown: CancellationToken) {
    let mut ticker = interval(RETENTION_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let cutoff = Utc::now() - retention;
                match store.purge_older_than(cutoff).await {
                    Ok(removed) => info!("Removed {} samples older than {}", removed, cutoff),
                    Err(err) => warn!("Retention cleanup failed: {}", err),
                }
            }
        }
    }
}
