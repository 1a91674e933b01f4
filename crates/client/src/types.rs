use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub client: ClientSettings,
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let settings = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path))?;
        let settings: Settings = serde_yaml::from_str(&settings)
            .with_context(|| format!("Failed to parse config file '{}'", path))?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    pub description: Option<String>,
    pub id: String,
    pub alias: Option<String>,
    pub server_addr: String,
    pub server_name: Option<String>,
    // Capture device. The first up, non-loopback interface with an IPv4 address when unset.
    pub interface: Option<String>,
    // How often the bandwidth counters are folded into a sample, in milliseconds.
    pub sample_interval_ms: Option<u64>,
    // How often the latest sample is sent to the collector, in milliseconds.
    pub report_interval_ms: Option<u64>,
    // How often a disconnected client tries to reach the collector again, in seconds.
    pub retry_interval_secs: Option<u64>,
    // Consecutive send failures tolerated before the connection is dropped.
    pub max_failures: Option<u32>,
}

impl ClientSettings {
    pub fn validate(mut self) -> Result<Self> {
        if self.id.trim().is_empty() {
            bail!("Client id must not be empty");
        }
        if self.server_addr.trim().is_empty() {
            bail!("Server address must not be empty");
        }

        if self.alias.as_deref().map_or(true, str::is_empty) {
            info!("Alias not set; using client id '{}'.", self.id);
            self.alias = Some(self.id.clone());
        }
        if self.server_name.is_none() {
            self.server_name = Some(String::from("localhost"));
        }
        if matches!(self.sample_interval_ms, None | Some(0)) {
            info!("Sample interval not set; setting to 500ms.");
            self.sample_interval_ms = Some(500);
        }
        if matches!(self.report_interval_ms, None | Some(0)) {
            info!("Report interval not set; setting to 1000ms.");
            self.report_interval_ms = Some(1000);
        }
        if matches!(self.retry_interval_secs, None | Some(0)) {
            info!("Retry interval not set; setting to 300s.");
            self.retry_interval_secs = Some(300);
        }
        if matches!(self.max_failures, None | Some(0)) {
            info!("Failure threshold not set; setting to 5.");
            self.max_failures = Some(5);
        }

        Ok(self)
    }

    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.id)
    }

    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or("localhost")
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.unwrap_or(500))
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.unwrap_or(1000))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.unwrap_or(300))
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures.unwrap_or(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_defaults() {
        let settings: Settings = serde_yaml::from_str(
            "client:\n  id: edge-1\n  serverAddr: collector.lan:4433\n  sampleIntervalMs: 250\n",
        )
        .unwrap();
        let client = settings.client.validate().unwrap();

        assert_eq!(client.alias(), "edge-1");
        assert_eq!(client.server_name(), "localhost");
        assert_eq!(client.sample_interval(), Duration::from_millis(250));
        assert_eq!(client.report_interval(), Duration::from_secs(1));
        assert_eq!(client.retry_interval(), Duration::from_secs(300));
        assert_eq!(client.max_failures(), 5);
        assert_eq!(client.interface, None);
    }

    #[test]
    fn requires_identity_and_server() {
        let settings: Settings = serde_yaml::from_str("client:\n  id: ''\n  serverAddr: x:1\n").unwrap();
        assert!(settings.client.validate().is_err());

        let settings: Settings = serde_yaml::from_str("client:\n  id: a\n  serverAddr: ' '\n").unwrap();
        assert!(settings.client.validate().is_err());
    }
}
