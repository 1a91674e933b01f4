use std::sync::Arc;

use anyhow::Result;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{pump_frames, DatalinkSource};
use crate::monitor::{BandwidthMonitor, LocalNetworks};
use crate::telemetry::{DeliveryPolicy, Identity, TelemetryClient};
use crate::types::ClientSettings;
use crate::uplink::QuicUplink;

#[derive(Clone)]
pub struct Service {
    shutdown: CancellationToken,
    settings: ClientSettings,
}

impl Service {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            settings,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let settings = &self.settings;

        let monitor = Arc::new(BandwidthMonitor::new(LocalNetworks::discover()?, settings.sample_interval()));

        // Failing to open the capture device is the one error the client does not survive.
        let source = DatalinkSource::open(settings.interface.as_deref())?;
        info!(
            "Capturing on '{}' with {} local networks",
            source.name(),
            monitor.local_networks().networks().len()
        );

        let uplink = QuicUplink::new(&settings.server_addr, settings.server_name())?;
        let identity = Identity {
            client_id: settings.id.clone(),
            alias: settings.alias().to_string(),
        };
        let policy = DeliveryPolicy {
            max_failures: settings.max_failures(),
            ..Default::default()
        };
        let client = Arc::new(TelemetryClient::new(identity, uplink, monitor.clone(), policy));

        match client.connect().await {
            Ok(()) => client.start_monitoring(),
            Err(err) => warn!(
                "Collector unreachable at startup: {:#}; retrying every {:?}",
                err,
                settings.retry_interval()
            ),
        }

        let mut join_capture = tokio::task::spawn_blocking({
            let monitor = monitor.clone();
            let shutdown = self.shutdown.clone();
            move || pump_frames(source, monitor, shutdown)
        });

        let mut join_reporting = tokio::spawn({
            let client = client.clone();
            let shutdown = self.shutdown.clone();
            let sample_interval = settings.sample_interval();
            let report_interval = settings.report_interval();
            async move { client.run_reporting(sample_interval, report_interval, shutdown).await }
        });

        let mut join_supervisor = tokio::spawn({
            let client = client.clone();
            let shutdown = self.shutdown.clone();
            let retry_interval = settings.retry_interval();
            async move { client.supervise(retry_interval, shutdown).await }
        });

        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl + c received; shutting down...");
            }
            _ = self.shutdown.cancelled() => {}
            result = &mut join_capture => {
                match result {
                    Ok(Err(err)) => warn!("capture thread failed: {}", err),
                    _ => warn!("capture thread closed"),
                }
            }
            _ = &mut join_reporting => {
                warn!("reporting thread closed");
            }
            _ = &mut join_supervisor => {
                warn!("supervisor thread closed");
            }
        }

        debug!("shutdown starting; sending cancel");
        self.shutdown.cancel();
        client.shutdown().await;
        debug!("shutdown finished; cancel returned");
        Ok(())
    }
}
