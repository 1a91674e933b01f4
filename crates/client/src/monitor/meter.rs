use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::capture::Frame;
use crate::monitor::classify::{classify, parse_flow, Direction, FlowKey, LocalNetworks};

/// Hard cap on remembered flows.
pub const FLOW_CACHE_CAPACITY: usize = 10_000;
/// Remembered flows are forgotten at least this often.
pub const FLOW_CACHE_MAX_AGE: Duration = Duration::from_secs(5 * 60);
/// Span of rate history used for smoothing.
pub const HISTORY_SPAN: Duration = Duration::from_secs(2);

/// The published statistic, recomputed once per sample tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    /// Smoothed bytes per second.
    pub upload_speed: f64,
    /// Smoothed bytes per second.
    pub download_speed: f64,
    pub avg_upload_packet_size: f64,
    pub avg_download_packet_size: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub upload_bytes: u64,
    pub upload_packets: u64,
    pub download_bytes: u64,
    pub download_packets: u64,
}

impl Counters {
    fn add(&mut self, bytes: usize, direction: Direction) {
        match direction {
            Direction::Upload => {
                self.upload_bytes += bytes as u64;
                self.upload_packets += 1;
            }
            Direction::Download => {
                self.download_bytes += bytes as u64;
                self.download_packets += 1;
            }
        }
    }

    fn merge(&mut self, other: &Counters) {
        self.upload_bytes += other.upload_bytes;
        self.upload_packets += other.upload_packets;
        self.download_bytes += other.download_bytes;
        self.download_packets += other.download_packets;
    }
}

/// Fixed-capacity FIFO of raw rates.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl HistoryWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.values.push_back(value);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn trimmed_mean(&self) -> f64 {
        let values: Vec<f64> = self.values.iter().copied().collect();
        trimmed_mean(&values)
    }
}

/// Mean after dropping the lowest and highest 10% (rounded down) of the values.
/// Fewer than ten values are averaged as they are.
pub fn trimmed_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let trim = if sorted.len() >= 10 { sorted.len() / 10 } else { 0 };
    let kept = &sorted[trim..sorted.len() - trim];
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Window length that covers `HISTORY_SPAN` at the given sample interval. Samples per second are
/// truncated, so 400 ms gives two per second.
pub fn history_capacity(sample_interval: Duration) -> usize {
    let per_second = match sample_interval.as_nanos() {
        0 => 1,
        nanos => (Duration::from_secs(1).as_nanos() / nanos) as usize,
    };
    per_second.max(1) * HISTORY_SPAN.as_secs() as usize
}

/// Set of recently seen flows, kept only so its size stays bounded.
#[derive(Debug)]
pub struct FlowDedupCache {
    flows: HashSet<FlowKey>,
    capacity: usize,
    max_age: Duration,
    cleared_at: Instant,
}

impl FlowDedupCache {
    pub fn new(capacity: usize, max_age: Duration, now: Instant) -> Self {
        Self {
            flows: HashSet::new(),
            capacity,
            max_age,
            cleared_at: now,
        }
    }

    pub fn insert(&mut self, flow: FlowKey, now: Instant) {
        if self.flows.len() >= self.capacity && !self.flows.contains(&flow) {
            self.clear(now);
        }
        self.flows.insert(flow);
    }

    /// Clears the cache when it is over capacity or older than its maximum age.
    pub fn maintain(&mut self, now: Instant) -> bool {
        let expired = now.saturating_duration_since(self.cleared_at) > self.max_age;
        if self.flows.len() > self.capacity || expired {
            self.clear(now);
            return true;
        }
        false
    }

    fn clear(&mut self, now: Instant) {
        trace!("Clearing {} remembered flows", self.flows.len());
        self.flows.clear();
        self.cleared_at = now;
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

struct MeterState {
    counters: Counters,
    totals: Counters,
    last_tick: Instant,
    upload_history: HistoryWindow,
    download_history: HistoryWindow,
    latest: Option<Sample>,
    flows: FlowDedupCache,
}

/// The measurement engine: classifies frames, accumulates counters and publishes smoothed
/// rates. Counters, history and the flow cache share one lock.
pub struct BandwidthMonitor {
    local: LocalNetworks,
    state: Mutex<MeterState>,
    active: AtomicBool,
}

impl BandwidthMonitor {
    pub fn new(local: LocalNetworks, sample_interval: Duration) -> Self {
        let now = Instant::now();
        let capacity = history_capacity(sample_interval);
        Self {
            local,
            state: Mutex::new(MeterState {
                counters: Counters::default(),
                totals: Counters::default(),
                last_tick: now,
                upload_history: HistoryWindow::new(capacity),
                download_history: HistoryWindow::new(capacity),
                latest: None,
                flows: FlowDedupCache::new(FLOW_CACHE_CAPACITY, FLOW_CACHE_MAX_AGE, now),
            }),
            active: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, MeterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_networks(&self) -> &LocalNetworks {
        &self.local
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Re-anchors the accumulation window so the first sample only covers active time.
    pub fn start(&self) {
        let mut state = self.state();
        state.counters = Counters::default();
        state.last_tick = Instant::now();
        self.active.store(true, Ordering::Release);
        debug!("Bandwidth monitoring started");
    }

    pub fn stop(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            debug!("Bandwidth monitoring stopped");
        }
    }

    /// Classifies and accounts one captured frame. Returns `None` when the frame was not
    /// counted, either because monitoring is stopped or the frame did not parse.
    pub fn observe(&self, frame: &Frame) -> Option<Direction> {
        if !self.is_active() {
            return None;
        }

        let flow = match parse_flow(&frame.data) {
            Ok(flow) => flow,
            Err(err) => {
                trace!("Dropping malformed frame ({} bytes): {}", frame.length, err);
                return None;
            }
        };

        let direction = match &flow {
            Some(key) => classify(&self.local, key.src_addr, key.dst_addr, key.src_port, key.dst_port),
            None => Direction::Upload,
        };

        self.record(flow, frame.length, direction);
        Some(direction)
    }

    pub fn update(&self, bytes: usize, direction: Direction) {
        self.record(None, bytes, direction);
    }

    fn record(&self, flow: Option<FlowKey>, bytes: usize, direction: Direction) {
        let mut state = self.state();
        if let Some(flow) = flow {
            let now = Instant::now();
            state.flows.insert(flow, now);
        }
        state.counters.add(bytes, direction);
    }

    /// Folds the bytes accumulated since the previous tick into the rate history and publishes
    /// a new sample. Does nothing when no time has elapsed.
    pub fn calculate_speeds(&self, now: Instant) -> Option<Sample> {
        let mut state = self.state();

        let elapsed = now.saturating_duration_since(state.last_tick).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        let counters = state.counters;
        state.upload_history.push(counters.upload_bytes as f64 / elapsed);
        state.download_history.push(counters.download_bytes as f64 / elapsed);

        let mut sample = Sample {
            timestamp: Utc::now(),
            upload_speed: state.upload_history.trimmed_mean(),
            download_speed: state.download_history.trimmed_mean(),
            ..state.latest.unwrap_or_default()
        };
        if counters.upload_packets > 0 {
            sample.avg_upload_packet_size = counters.upload_bytes as f64 / counters.upload_packets as f64;
        }
        if counters.download_packets > 0 {
            sample.avg_download_packet_size = counters.download_bytes as f64 / counters.download_packets as f64;
        }

        state.totals.merge(&counters);
        state.counters = Counters::default();
        state.last_tick = now;
        state.latest = Some(sample);
        state.flows.maintain(now);

        Some(sample)
    }

    /// The most recently published sample, `None` until the first tick with elapsed time.
    pub fn snapshot(&self) -> Option<Sample> {
        self.state().latest
    }

    /// Counters accumulated since the last tick.
    pub fn pending(&self) -> Counters {
        self.state().counters
    }

    /// Everything counted since the monitor was created, excluding the current window.
    pub fn totals(&self) -> Counters {
        self.state().totals
    }

    pub fn history_len(&self) -> (usize, usize) {
        let state = self.state();
        (state.upload_history.len(), state.download_history.len())
    }

    pub fn remembered_flows(&self) -> usize {
        self.state().flows.len()
    }
}

/// Renders bytes per second as bits per second with a decimal unit.
pub fn format_bandwidth(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["bps", "Kbps", "Mbps", "Gbps"];
    let mut value = bytes_per_sec * 8.0;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use etherparse::PacketBuilder;

    use super::*;
    use crate::monitor::classify::TransportProtocol;

    fn monitor() -> BandwidthMonitor {
        let local = LocalNetworks::new(
            vec!["192.168.1.10".parse().unwrap()],
            vec!["192.168.1.10/24".parse().unwrap()],
        );
        BandwidthMonitor::new(local, Duration::from_millis(500))
    }

    fn flow(n: u16) -> FlowKey {
        FlowKey {
            src_addr: IpAddr::from([10, 0, 0, 1]),
            src_port: n,
            dst_addr: IpAddr::from([10, 0, 0, 2]),
            dst_port: 443,
            protocol: TransportProtocol::Tcp,
        }
    }

    #[test]
    fn trims_ten_percent_from_each_end() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(trimmed_mean(&values), 5.5);

        let mut skewed: Vec<f64> = (1..=9).map(f64::from).collect();
        skewed.push(1_000_000.0);
        assert_eq!(trimmed_mean(&skewed), 5.5);
    }

    #[test]
    fn classifies_against_its_local_networks() {
        let monitor = monitor();
        assert_eq!(monitor.local_networks().networks().len(), 1);
        assert!(monitor.local_networks().contains("192.168.1.77".parse().unwrap()));
        assert!(!monitor.local_networks().contains("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn short_windows_are_not_trimmed() {
        assert_eq!(trimmed_mean(&[]), 0.0);
        assert_eq!(trimmed_mean(&[4.0, 100.0, 1.0]), 35.0);
    }

    #[test]
    fn history_window_is_bounded() {
        let mut window = HistoryWindow::new(4);
        for i in 0..100 {
            window.push(f64::from(i));
            assert!(window.len() <= window.capacity());
        }
        assert_eq!(window.trimmed_mean(), 97.5);
    }

    #[test]
    fn capacity_spans_two_seconds() {
        assert_eq!(history_capacity(Duration::from_millis(500)), 4);
        assert_eq!(history_capacity(Duration::from_millis(100)), 20);
        assert_eq!(history_capacity(Duration::from_secs(5)), 2);
        assert_eq!(history_capacity(Duration::from_millis(400)), 4);
        assert_eq!(history_capacity(Duration::from_millis(300)), 6);
    }

    #[test]
    fn flow_cache_never_exceeds_capacity() {
        let start = Instant::now();
        let mut cache = FlowDedupCache::new(100, FLOW_CACHE_MAX_AGE, start);
        for n in 0..1000 {
            cache.insert(flow(n), start);
            assert!(cache.len() <= 100);
        }
        cache.insert(flow(999), start);
        assert!(cache.len() <= 100);
    }

    #[tokio::test(start_paused = true)]
    async fn flow_cache_expires_after_max_age() {
        let start = Instant::now();
        let mut cache = FlowDedupCache::new(FLOW_CACHE_CAPACITY, FLOW_CACHE_MAX_AGE, start);
        cache.insert(flow(1), start);
        cache.insert(flow(2), start);

        assert!(!cache.maintain(start + Duration::from_secs(299)));
        assert_eq!(cache.len(), 2);

        assert!(cache.maintain(start + Duration::from_secs(301)));
        assert!(cache.is_empty());

        // The clear re-anchors the age.
        cache.insert(flow(3), start + Duration::from_secs(302));
        assert!(!cache.maintain(start + Duration::from_secs(500)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_reports_raw_rate() {
        let monitor = monitor();
        monitor.start();
        monitor.update(600, Direction::Upload);
        monitor.update(400, Direction::Upload);
        monitor.update(250, Direction::Download);

        tokio::time::advance(Duration::from_millis(500)).await;
        let sample = monitor.calculate_speeds(Instant::now()).unwrap();

        assert!((sample.upload_speed - 2000.0).abs() < 1e-6);
        assert!((sample.download_speed - 500.0).abs() < 1e-6);
        assert_eq!(sample.avg_upload_packet_size, 500.0);
        assert_eq!(sample.avg_download_packet_size, 250.0);
        assert_eq!(monitor.pending(), Counters::default());
        assert_eq!(monitor.totals().upload_bytes, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_tick_keeps_previous_packet_sizes() {
        let monitor = monitor();
        monitor.start();
        monitor.update(1500, Direction::Download);
        tokio::time::advance(Duration::from_millis(500)).await;
        monitor.calculate_speeds(Instant::now()).unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        let sample = monitor.calculate_speeds(Instant::now()).unwrap();
        assert_eq!(sample.avg_download_packet_size, 1500.0);
        assert!((sample.download_speed - 1500.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_elapsed_is_a_no_op() {
        let monitor = monitor();
        monitor.start();
        monitor.update(1000, Direction::Upload);

        let now = Instant::now();
        assert!(monitor.calculate_speeds(now).is_none());
        assert!(monitor.snapshot().is_none());
        assert_eq!(monitor.history_len(), (0, 0));
        assert_eq!(monitor.pending().upload_bytes, 1000);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(monitor.calculate_speeds(Instant::now()).is_some());
        assert_eq!(monitor.pending(), Counters::default());
        assert!((monitor.snapshot().unwrap().upload_speed - 2000.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn history_stays_bounded_across_ticks() {
        let monitor = monitor();
        monitor.start();
        for _ in 0..50 {
            monitor.update(100, Direction::Upload);
            tokio::time::advance(Duration::from_millis(500)).await;
            monitor.calculate_speeds(Instant::now());
            let (up, down) = monitor.history_len();
            assert!(up <= 4 && down <= 4);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn observes_frames_only_while_active() {
        let monitor = monitor();
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4([192, 168, 1, 10], [93, 184, 216, 34], 64)
            .udp(40000, 53);
        let mut data = Vec::new();
        builder.write(&mut data, &[0u8; 20]).unwrap();
        let frame = Frame::new(data);

        assert_eq!(monitor.observe(&frame), None);
        monitor.start();
        assert_eq!(monitor.observe(&frame), Some(Direction::Upload));
        assert_eq!(monitor.pending().upload_bytes, frame.length as u64);
        assert_eq!(monitor.remembered_flows(), 1);

        monitor.stop();
        assert_eq!(monitor.observe(&frame), None);
        assert_eq!(monitor.observe(&Frame::new(vec![0u8; 6])), None);
    }

    #[test]
    fn formats_bits_per_second() {
        assert_eq!(format_bandwidth(0.0), "0.00 bps");
        assert_eq!(format_bandwidth(125.0), "1.00 Kbps");
        assert_eq!(format_bandwidth(2_500_000.0), "20.00 Mbps");
        assert_eq!(format_bandwidth(1e12), "8000.00 Gbps");
    }
}
