mod classify;
mod meter;

pub use classify::{
    classify, parse_flow, up_interfaces, Direction, FlowKey, LocalNetworks, TransportProtocol, SERVICE_PORT_LIMIT,
};
pub use meter::{
    format_bandwidth, history_capacity, trimmed_mean, BandwidthMonitor, Counters, FlowDedupCache, HistoryWindow,
    Sample, FLOW_CACHE_CAPACITY, FLOW_CACHE_MAX_AGE,
};
