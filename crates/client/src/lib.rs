pub mod capture;
pub mod monitor;
pub mod service;
pub mod telemetry;
pub mod types;
pub mod uplink;

pub use service::Service;
pub use telemetry::{Phase, TelemetryClient};
pub use types::{ClientSettings, Settings};
