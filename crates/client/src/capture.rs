use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use etherparse::{EtherType, Ethernet2HeaderSlice};
use pnet_datalink::{Channel, DataLinkReceiver, NetworkInterface};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::monitor::BandwidthMonitor;

// Bounds how long a capture read blocks before the pump re-checks for shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("interface '{0}' not found")]
    InterfaceNotFound(String),
    #[error("no interface suitable for capture")]
    NoInterface,
    #[error("interface '{0}' does not provide an ethernet channel")]
    UnsupportedChannel(String),
    #[error("failed to open interface '{iface}': {source}")]
    Open {
        iface: String,
        source: std::io::Error,
    },
    #[error("capture read failed: {0}")]
    Read(#[from] std::io::Error),
}

/// One captured link-layer frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: DateTime<Utc>,
    /// On-wire length of the frame.
    pub length: usize,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            timestamp: Utc::now(),
            length: data.len(),
            data,
        }
    }
}

/// A blocking supplier of IP frames.
pub trait PacketSource: Send {
    /// Waits for the next frame. `Ok(None)` means the read timed out without one.
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

/// Live capture from a network interface through a datalink socket.
pub struct DatalinkSource {
    iface: String,
    rx: Box<dyn DataLinkReceiver>,
}

impl DatalinkSource {
    pub fn open(name: Option<&str>) -> Result<Self, CaptureError> {
        let interfaces = pnet_datalink::interfaces();
        let iface = match name {
            Some(name) => interfaces
                .into_iter()
                .find(|iface| iface.name == name)
                .ok_or_else(|| CaptureError::InterfaceNotFound(name.to_string()))?,
            None => default_interface(interfaces).ok_or(CaptureError::NoInterface)?,
        };

        let config = pnet_datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            promiscuous: true,
            ..Default::default()
        };

        match pnet_datalink::channel(&iface, config) {
            Ok(Channel::Ethernet(_tx, rx)) => Ok(Self { iface: iface.name, rx }),
            Ok(_) => Err(CaptureError::UnsupportedChannel(iface.name)),
            Err(source) => Err(CaptureError::Open { iface: iface.name, source }),
        }
    }

    pub fn name(&self) -> &str {
        &self.iface
    }
}

impl PacketSource for DatalinkSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        loop {
            match self.rx.next() {
                Ok(data) => {
                    if is_ip_frame(data) {
                        return Ok(Some(Frame::new(data.to_vec())));
                    }
                }
                Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// First interface that is up, not loopback and has an IPv4 address.
fn default_interface(interfaces: Vec<NetworkInterface>) -> Option<NetworkInterface> {
    interfaces
        .into_iter()
        .find(|iface| iface.is_up() && !iface.is_loopback() && iface.ips.iter().any(|ip| ip.is_ipv4()))
}

// Equivalent of an "ip or ip6" capture filter.
fn is_ip_frame(data: &[u8]) -> bool {
    Ethernet2HeaderSlice::from_slice(data)
        .map(|eth| matches!(eth.ether_type(), EtherType::IPV4 | EtherType::IPV6))
        .unwrap_or(false)
}

/// Feeds frames from `source` into the monitor until cancelled or the source fails.
/// Runs on a blocking thread.
pub fn pump_frames<S: PacketSource>(
    mut source: S,
    monitor: Arc<BandwidthMonitor>,
    shutdown: CancellationToken,
) -> Result<(), CaptureError> {
    let mut counted = 0u64;
    while !shutdown.is_cancelled() {
        match source.next_frame() {
            Ok(Some(frame)) => {
                if monitor.observe(&frame).is_some() {
                    counted += 1;
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!("Capture failed after {} frames: {}", counted, err);
                return Err(err);
            }
        }
    }
    debug!("Shutdown signal received; closing capture after {} frames", counted);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use etherparse::PacketBuilder;

    use super::*;
    use crate::monitor::{Direction, LocalNetworks};

    struct ReplaySource {
        frames: VecDeque<Frame>,
        shutdown: CancellationToken,
    }

    impl PacketSource for ReplaySource {
        fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            match self.frames.pop_front() {
                Some(frame) => Ok(Some(frame)),
                None => {
                    self.shutdown.cancel();
                    Ok(None)
                }
            }
        }
    }

    fn udp_frame(src: [u8; 4], dst: [u8; 4]) -> Frame {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4(src, dst, 64)
            .udp(40000, 53);
        let mut data = Vec::new();
        builder.write(&mut data, &[0u8; 18]).unwrap();
        Frame::new(data)
    }

    #[test]
    fn recognises_ip_ethertypes() {
        let frame = udp_frame([10, 0, 0, 1], [10, 0, 0, 2]);
        assert!(is_ip_frame(&frame.data));

        let mut arp = frame.data.clone();
        arp[12] = 0x08;
        arp[13] = 0x06;
        assert!(!is_ip_frame(&arp));
        assert!(!is_ip_frame(&[0u8; 4]));
    }

    #[tokio::test]
    async fn pump_accounts_every_frame() {
        let local = LocalNetworks::new(vec!["10.0.0.1".parse().unwrap()], vec![]);
        let monitor = Arc::new(BandwidthMonitor::new(local, Duration::from_millis(500)));
        monitor.start();

        let shutdown = CancellationToken::new();
        let up = udp_frame([10, 0, 0, 1], [1, 1, 1, 1]);
        let down = udp_frame([1, 1, 1, 1], [10, 0, 0, 1]);
        let source = ReplaySource {
            frames: VecDeque::from(vec![up.clone(), down.clone(), Frame::new(vec![0xff; 3]), up.clone()]),
            shutdown: shutdown.clone(),
        };

        pump_frames(source, monitor.clone(), shutdown).unwrap();

        let pending = monitor.pending();
        assert_eq!(pending.upload_packets, 2);
        assert_eq!(pending.upload_bytes, 2 * up.length as u64);
        assert_eq!(pending.download_packets, 1);
        assert_eq!(monitor.observe(&down), Some(Direction::Download));
    }
}
