use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use shared::TelemetryMessage;
use tokio::select;
use tokio::time::{interval, interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::monitor::{format_bandwidth, BandwidthMonitor, Sample};
use crate::uplink::{SendError, Uplink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    /// Connected and reporting.
    Monitoring,
    /// Connected, but the last send failed.
    Degraded,
    /// Supervisor is re-establishing the connection.
    Reconnecting,
    /// Supervisor is sending verification probes over a fresh connection.
    Verifying,
}

impl Phase {
    fn is_reporting(self) -> bool {
        matches!(self, Phase::Monitoring | Phase::Degraded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Dropped because the previous send was too recent.
    Throttled,
    Failed,
    /// The failure threshold was reached and the connection dropped.
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub min_send_spacing: Duration,
    pub max_failures: u32,
    pub warmup: Duration,
    pub probe_count: u32,
    pub probe_spacing: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            min_send_spacing: Duration::from_millis(500),
            max_failures: 5,
            warmup: Duration::from_secs(2),
            probe_count: 5,
            probe_spacing: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub client_id: String,
    pub alias: String,
}

struct Delivery {
    phase: Phase,
    failures: u32,
    last_send: Option<Instant>,
}

/// Reports engine samples to the collector and recovers the connection when it breaks.
pub struct TelemetryClient<U: Uplink> {
    identity: Identity,
    uplink: U,
    monitor: Arc<BandwidthMonitor>,
    policy: DeliveryPolicy,
    delivery: Mutex<Delivery>,
}

impl<U: Uplink> TelemetryClient<U> {
    pub fn new(identity: Identity, uplink: U, monitor: Arc<BandwidthMonitor>, policy: DeliveryPolicy) -> Self {
        Self {
            identity,
            uplink,
            monitor,
            policy,
            delivery: Mutex::new(Delivery {
                phase: Phase::Disconnected,
                failures: 0,
                last_send: None,
            }),
        }
    }

    fn delivery(&self) -> MutexGuard<'_, Delivery> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: Phase) {
        self.delivery().phase = phase;
    }

    pub fn phase(&self) -> Phase {
        self.delivery().phase
    }

    pub fn failures(&self) -> u32 {
        self.delivery().failures
    }

    pub fn monitor(&self) -> &Arc<BandwidthMonitor> {
        &self.monitor
    }

    /// Opens the channel to the collector. A failure leaves the client disconnected.
    pub async fn connect(&self) -> Result<()> {
        self.set_phase(Phase::Connecting);
        match self.uplink.connect().await {
            Ok(()) => {
                let mut delivery = self.delivery();
                delivery.phase = Phase::Monitoring;
                delivery.failures = 0;
                Ok(())
            }
            Err(err) => {
                self.set_phase(Phase::Disconnected);
                Err(err)
            }
        }
    }

    pub fn start_monitoring(&self) {
        self.monitor.start();
    }

    pub fn stop_monitoring(&self) {
        self.monitor.stop();
    }

    fn message(&self, sample: &Sample) -> TelemetryMessage {
        TelemetryMessage {
            client_id: self.identity.client_id.clone(),
            alias: self.identity.alias.clone(),
            timestamp: Some(sample.timestamp),
            upload_speed: sample.upload_speed,
            download_speed: sample.download_speed,
            avg_upload_packet_size: sample.avg_upload_packet_size,
            avg_download_packet_size: sample.avg_download_packet_size,
        }
    }

    async fn deliver(&self, sample: &Sample) -> Result<(), SendError> {
        let payload = self.message(sample).encode()?;
        self.uplink.send(payload).await
    }

    /// Sends one sample unless the previous send is less than the minimum spacing ago.
    /// Throttled samples are dropped, failed ones are not retried.
    pub async fn send_sample(&self, sample: &Sample) -> SendOutcome {
        {
            let delivery = self.delivery();
            if let Some(last_send) = delivery.last_send {
                if last_send.elapsed() < self.policy.min_send_spacing {
                    return SendOutcome::Throttled;
                }
            }
        }

        match self.deliver(sample).await {
            Ok(()) => {
                debug!(monotonic_counter.telemetry_samples_sent = 1u64, "Sample sent");
                let mut delivery = self.delivery();
                delivery.failures = 0;
                delivery.last_send = Some(Instant::now());
                if delivery.phase == Phase::Degraded {
                    info!("Send recovered; resuming normal reporting");
                    delivery.phase = Phase::Monitoring;
                }
                SendOutcome::Sent
            }
            Err(err) => {
                let failures = {
                    let mut delivery = self.delivery();
                    delivery.failures += 1;
                    if delivery.failures >= self.policy.max_failures {
                        delivery.phase = Phase::Disconnected;
                        delivery.failures = 0;
                        None
                    } else {
                        if delivery.phase == Phase::Monitoring {
                            delivery.phase = Phase::Degraded;
                        }
                        Some(delivery.failures)
                    }
                };

                match failures {
                    Some(failures) => {
                        warn!(
                            monotonic_counter.telemetry_send_failures = 1u64,
                            "Failed to send sample ({}/{}): {}", failures, self.policy.max_failures, err
                        );
                        SendOutcome::Failed
                    }
                    None => {
                        warn!(
                            monotonic_counter.telemetry_send_failures = 1u64,
                            event = "disconnect",
                            "Failed to send sample ({0}/{0}): {1}; dropping connection",
                            self.policy.max_failures, err
                        );
                        self.stop_monitoring();
                        self.uplink.disconnect().await;
                        SendOutcome::Disconnected
                    }
                }
            }
        }
    }

    /// Sends the latest engine sample. Returns `None` without sending outside a reporting phase
    /// or before the engine has published its first sample.
    pub async fn report(&self) -> Option<SendOutcome> {
        if !self.phase().is_reporting() {
            return None;
        }
        let sample = self.monitor.snapshot()?;
        Some(self.send_sample(&sample).await)
    }

    // Re-reads the engine; publishes a sample itself when none exists yet (sample interval longer
    // than the warm-up).
    fn verification_sample(&self) -> Option<Sample> {
        self.monitor
            .snapshot()
            .or_else(|| self.monitor.calculate_speeds(Instant::now()))
    }

    /// One supervisor attempt: reconnect, warm up, then confirm the pipeline with a run of
    /// probes. Only acts while disconnected. Returns whether reporting resumed.
    pub async fn reconnect(&self) -> bool {
        {
            let mut delivery = self.delivery();
            if delivery.phase != Phase::Disconnected {
                return false;
            }
            delivery.phase = Phase::Reconnecting;
        }

        info!("Trying to reconnect to the collector");
        if let Err(err) = self.uplink.connect().await {
            warn!("Reconnect failed: {:#}", err);
            self.set_phase(Phase::Disconnected);
            return false;
        }

        self.set_phase(Phase::Verifying);
        self.start_monitoring();
        sleep(self.policy.warmup).await;

        for probe in 1..=self.policy.probe_count {
            if probe > 1 {
                sleep(self.policy.probe_spacing).await;
            }
            let delivered = match self.verification_sample() {
                Some(sample) => self.deliver(&sample).await.map_err(anyhow::Error::from),
                None => Err(anyhow!("no sample published yet")),
            };
            if let Err(err) = delivered {
                warn!("Verification probe {}/{} failed: {}; aborting reconnect", probe, self.policy.probe_count, err);
                self.stop_monitoring();
                self.uplink.disconnect().await;
                self.set_phase(Phase::Disconnected);
                return false;
            }
            debug!("Verification probe {}/{} delivered", probe, self.policy.probe_count);
            self.delivery().last_send = Some(Instant::now());
        }

        let mut delivery = self.delivery();
        delivery.phase = Phase::Monitoring;
        delivery.failures = 0;
        info!(event = "reconnected", "Connection verified; resuming normal reporting");
        true
    }

    /// Drives the sample and report ticks until cancelled.
    pub async fn run_reporting(&self, sample_interval: Duration, report_interval: Duration, shutdown: CancellationToken) {
        let mut sample_tick = interval(sample_interval);
        let mut report_tick = interval(report_interval);
        sample_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        report_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    debug!("Shutdown signal received; closing reporting loop");
                    return;
                }
                _ = sample_tick.tick() => {
                    if !self.monitor.is_active() {
                        continue;
                    }
                    // A slow send delays this tick; the window ends now, not at the deadline.
                    if let Some(sample) = self.monitor.calculate_speeds(Instant::now()) {
                        debug!(
                            histogram.upload_bytes_per_sec = sample.upload_speed,
                            histogram.download_bytes_per_sec = sample.download_speed,
                            "Upload: {} ({:.2} bytes/packet) | Download: {} ({:.2} bytes/packet)",
                            format_bandwidth(sample.upload_speed),
                            sample.avg_upload_packet_size,
                            format_bandwidth(sample.download_speed),
                            sample.avg_download_packet_size,
                        );
                    }
                }
                _ = report_tick.tick() => {
                    self.report().await;
                }
            }
        }
    }

    /// Runs a reconnect attempt on every retry tick while disconnected, until cancelled.
    pub async fn supervise(&self, retry_interval: Duration, shutdown: CancellationToken) {
        let mut retry_tick = interval_at(Instant::now() + retry_interval, retry_interval);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    debug!("Shutdown signal received; closing reconnect supervisor");
                    return;
                }
                _ = retry_tick.tick() => {
                    if self.phase() == Phase::Disconnected {
                        self.reconnect().await;
                    }
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        self.stop_monitoring();
        self.uplink.disconnect().await;
        self.set_phase(Phase::Disconnected);
    }
}
