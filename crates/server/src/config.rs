use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
pub struct Settings {
    pub server: Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub description: Option<String>,
    pub listen_addr: Option<String>,
    // Client timeout in seconds. A session that sends nothing for this long is evicted and its
    // connection closed.
    pub client_timeout: Option<u64>,
    // Seconds between two idle-session sweeps.
    pub sweep_interval: Option<u64>,
    // Days of samples kept by the store.
    pub retention_days: Option<u64>,
    // Seconds shutdown waits for connection handlers to finish.
    pub shutdown_timeout: Option<u64>,
}

impl Server {
    pub fn listen_addr(&self) -> &str {
        self.listen_addr.as_deref().unwrap_or("0.0.0.0:4433")
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout.unwrap_or(300))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.unwrap_or(60))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days.unwrap_or(7) as i64)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout.unwrap_or(5))
    }
}

pub fn load_config() -> Result<Settings> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| {
        String::from("bandwatch-server.yml")
    });

    let settings = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file '{}'", config_path))?;
    let settings: Settings = serde_yaml::from_str(&settings)
        .with_context(|| format!("Failed to parse config file '{}'", config_path))?;

    if let Some(description) = &settings.server.description {
        info!("{}", description);
    }

    Ok(settings)
}

pub fn validate_settings(mut settings: Settings) -> Result<Settings> {
    let server = &mut settings.server;

    if server.listen_addr.as_deref().map_or(true, str::is_empty) {
        info!("Listen address not set; setting to 0.0.0.0:4433.");
        server.listen_addr = Some(String::from("0.0.0.0:4433"));
    }

    if matches!(server.client_timeout, None | Some(0)) {
        info!("Client timeout not set; setting to 300s.");
        server.client_timeout = Some(300);
    }

    if matches!(server.sweep_interval, None | Some(0)) {
        info!("Sweep interval not set; setting to 60s.");
        server.sweep_interval = Some(60);
    }

    if matches!(server.retention_days, None | Some(0)) {
        info!("Retention not set; keeping samples for 7 days.");
        server.retention_days = Some(7);
    }

    if server.shutdown_timeout.is_none() {
        info!("Shutdown timeout not set; setting to 5s.");
        server.shutdown_timeout = Some(5);
    }

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_defaults() {
        let settings: Settings = serde_yaml::from_str("server:\n  clientTimeout: 0\n  sweepInterval: 10\n").unwrap();
        let settings = validate_settings(settings).unwrap();

        assert_eq!(settings.server.listen_addr(), "0.0.0.0:4433");
        assert_eq!(settings.server.client_timeout(), Duration::from_secs(300));
        assert_eq!(settings.server.sweep_interval(), Duration::from_secs(10));
        assert_eq!(settings.server.retention(), chrono::Duration::days(7));
        assert_eq!(settings.server.shutdown_timeout(), Duration::from_secs(5));
    }
}
