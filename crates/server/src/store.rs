use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("client '{0}' is not registered")]
    UnknownClient(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub alias: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoredSample {
    pub timestamp: DateTime<Utc>,
    pub upload_speed: f64,
    pub download_speed: f64,
    pub avg_upload_packet_size: f64,
    pub avg_download_packet_size: f64,
}

/// Where the collector keeps client identities and their samples.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Inserts the client or refreshes its alias and last-seen time.
    async fn register_client(&self, client_id: &str, alias: &str) -> Result<(), StoreError>;

    async fn save_sample(&self, client_id: &str, sample: StoredSample) -> Result<(), StoreError>;

    async fn client_info(&self, client_id: &str) -> Result<ClientInfo, StoreError>;

    /// Samples with `start <= timestamp <= end`, newest first.
    async fn samples(
        &self,
        client_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredSample>, StoreError>;

    /// Drops samples older than `cutoff` and returns how many were removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    clients: DashMap<String, ClientInfo>,
    samples: DashMap<String, Vec<StoredSample>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn register_client(&self, client_id: &str, alias: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        self.clients
            .entry(client_id.to_string())
            .and_modify(|client| {
                client.alias = alias.to_string();
                client.last_seen_at = now;
            })
            .or_insert_with(|| ClientInfo {
                client_id: client_id.to_string(),
                alias: alias.to_string(),
                created_at: now,
                last_seen_at: now,
            });
        Ok(())
    }

    async fn save_sample(&self, client_id: &str, sample: StoredSample) -> Result<(), StoreError> {
        let mut client = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| StoreError::UnknownClient(client_id.to_string()))?;
        client.last_seen_at = Utc::now();
        drop(client);

        self.samples.entry(client_id.to_string()).or_default().push(sample);
        Ok(())
    }

    async fn client_info(&self, client_id: &str) -> Result<ClientInfo, StoreError> {
        self.clients
            .get(client_id)
            .map(|client| client.clone())
            .ok_or_else(|| StoreError::UnknownClient(client_id.to_string()))
    }

    async fn samples(
        &self,
        client_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredSample>, StoreError> {
        let mut found: Vec<StoredSample> = self
            .samples
            .get(client_id)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|sample| sample.timestamp >= start && sample.timestamp <= end)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(found)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for mut samples in self.samples.iter_mut() {
            let before = samples.len();
            samples.retain(|sample| sample.timestamp >= cutoff);
            removed += before - samples.len();
        }
        debug!("Purged {} samples older than {}", removed, cutoff);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn sample_at(timestamp: DateTime<Utc>, upload_speed: f64) -> StoredSample {
        StoredSample {
            timestamp,
            upload_speed,
            download_speed: 0.0,
            avg_upload_packet_size: 0.0,
            avg_download_packet_size: 0.0,
        }
    }

    #[tokio::test]
    async fn registration_is_an_upsert() {
        let store = MemoryStore::new();
        store.register_client("edge-1", "office").await.unwrap();
        let first = store.client_info("edge-1").await.unwrap();

        store.register_client("edge-1", "warehouse").await.unwrap();
        let second = store.client_info("edge-1").await.unwrap();

        assert_eq!(store.client_count(), 1);
        assert_eq!(second.alias, "warehouse");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.last_seen_at >= first.last_seen_at);
    }

    #[tokio::test]
    async fn samples_require_a_registered_client() {
        let store = MemoryStore::new();
        let err = store.save_sample("ghost", sample_at(Utc::now(), 1.0)).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownClient(id) if id == "ghost"));
        assert!(matches!(store.client_info("ghost").await, Err(StoreError::UnknownClient(_))));
    }

    #[tokio::test]
    async fn queries_range_newest_first() {
        let store = MemoryStore::new();
        store.register_client("edge-1", "office").await.unwrap();
        let now = Utc::now();
        for minutes in [30, 10, 20, 90] {
            store
                .save_sample("edge-1", sample_at(now - Duration::minutes(minutes), minutes as f64))
                .await
                .unwrap();
        }

        let found = store.samples("edge-1", now - Duration::hours(1), now).await.unwrap();
        let speeds: Vec<f64> = found.iter().map(|s| s.upload_speed).collect();
        assert_eq!(speeds, vec![10.0, 20.0, 30.0]);
        assert!(store.samples("other", now - Duration::hours(1), now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purges_samples_past_retention() {
        let store = MemoryStore::new();
        store.register_client("edge-1", "office").await.unwrap();
        let now = Utc::now();
        store.save_sample("edge-1", sample_at(now - Duration::days(8), 1.0)).await.unwrap();
        store.save_sample("edge-1", sample_at(now - Duration::days(1), 2.0)).await.unwrap();

        assert_eq!(store.purge_older_than(now - Duration::days(7)).await.unwrap(), 1);
        let left = store.samples("edge-1", now - Duration::days(30), now).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].upload_speed, 2.0);
    }
}
