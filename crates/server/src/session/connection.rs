use std::sync::Arc;
use std::time::Duration;

use quinn::ConnectionError;
use shared::TelemetryMessage;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::session::manager::SessionManager;
use crate::session::types::ConnectionHandle;
use crate::store::{Persistence, StoreError, StoredSample};

/// How long a single telemetry stream may take to arrive in full.
pub const READ_DEADLINE: Duration = Duration::from_secs(5);

// Telemetry messages are a few hundred bytes; anything past this is not one.
const MAX_PAYLOAD: usize = 64 * 1024;

/// Identity a connection claimed with its first message; it never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub client_id: String,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Empty,
    Saved,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("malformed telemetry message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("telemetry message without client_id")]
    MissingClientId,
    #[error("telemetry message from '{0}' has no timestamp")]
    UnsetTimestamp(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Turns telemetry payloads into sessions and stored samples.
pub struct Ingestor<H> {
    sessions: SessionManager<H>,
    store: Arc<dyn Persistence>,
}

impl<H: ConnectionHandle> Ingestor<H> {
    pub fn new(sessions: SessionManager<H>, store: Arc<dyn Persistence>) -> Self {
        Self { sessions, store }
    }

    pub fn sessions(&self) -> &SessionManager<H> {
        &self.sessions
    }

    /// Processes one stream's payload received on `connection`.
    ///
    /// The first message that registers successfully fixes `identity` for the rest of the
    /// connection; later messages are stored under that identity whatever `client_id` they carry.
    pub async fn ingest(
        &self,
        payload: &[u8],
        connection: &H,
        identity: &mut Option<Identity>,
    ) -> Result<Ingested, IngestError> {
        if payload.is_empty() {
            return Ok(Ingested::Empty);
        }
        let message = TelemetryMessage::decode(payload)?;

        if identity.is_none() {
            if message.client_id.is_empty() {
                return Err(IngestError::MissingClientId);
            }
            self.store.register_client(&message.client_id, &message.alias).await?;
            self.sessions.register(&message.client_id, &message.alias, connection.clone());
            *identity = Some(Identity {
                client_id: message.client_id.clone(),
                alias: message.alias.clone(),
            });
        }
        let Some(identity) = identity.as_ref() else {
            return Err(IngestError::MissingClientId);
        };

        self.sessions.touch(&identity.client_id);

        let timestamp = message
            .valid_timestamp()
            .ok_or_else(|| IngestError::UnsetTimestamp(identity.client_id.clone()))?;

        let sample = StoredSample {
            timestamp,
            upload_speed: message.upload_speed,
            download_speed: message.download_speed,
            avg_upload_packet_size: message.avg_upload_packet_size,
            avg_download_packet_size: message.avg_download_packet_size,
        };
        self.store.save_sample(&identity.client_id, sample).await?;
        debug!(
            monotonic_counter.telemetry_samples_stored = 1u64,
            client_id = identity.client_id.as_str(),
            "Stored sample: up {:.0} B/s, down {:.0} B/s", sample.upload_speed, sample.download_speed
        );
        Ok(Ingested::Saved)
    }
}

/// Reads telemetry streams from one client connection until it closes or `shutdown` fires.
#[tracing::instrument(skip_all, fields(remote = %connection.remote_address()))]
pub async fn handle_connection(
    connection: quinn::Connection,
    ingestor: Arc<Ingestor<quinn::Connection>>,
    shutdown: CancellationToken,
) {
    debug!("Connection established");
    let mut identity: Option<Identity> = None;

    loop {
        let accepted = select! {
            _ = shutdown.cancelled() => break,
            accepted = connection.accept_uni() => accepted,
        };
        let mut stream = match accepted {
            Ok(stream) => stream,
            Err(ConnectionError::ApplicationClosed(_)) | Err(ConnectionError::LocallyClosed) => {
                debug!("Connection closed");
                break;
            }
            Err(err) => {
                debug!("Connection lost: {}", err);
                break;
            }
        };

        let payload = match tokio::time::timeout(READ_DEADLINE, stream.read_to_end(MAX_PAYLOAD)).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(err)) => {
                warn!("Failed to read telemetry stream: {}", err);
                continue;
            }
            Err(_) => {
                warn!("Telemetry stream not finished within {:?}; dropped", READ_DEADLINE);
                continue;
            }
        };

        match ingestor.ingest(&payload, &connection, &mut identity).await {
            Ok(Ingested::Saved) => {}
            Ok(Ingested::Empty) => trace!("Ignored empty stream"),
            Err(err) => warn!(monotonic_counter.telemetry_messages_dropped = 1u64, "Dropped telemetry message: {}", err),
        }
    }

    if let Some(identity) = identity {
        ingestor.sessions().remove_owned(&identity.client_id, connection.stable_id());
        info!(client_id = identity.client_id.as_str(), alias = identity.alias.as_str(), "Client connection finished");
    }
    ConnectionHandle::close(&connection, "connection closed");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::session::manager::tests::FakeConnection;
    use crate::store::{ClientInfo, MemoryStore};

    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        registrations: AtomicUsize,
    }

    #[async_trait]
    impl Persistence for CountingStore {
        async fn register_client(&self, client_id: &str, alias: &str) -> Result<(), StoreError> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            self.inner.register_client(client_id, alias).await
        }

        async fn save_sample(&self, client_id: &str, sample: StoredSample) -> Result<(), StoreError> {
            self.inner.save_sample(client_id, sample).await
        }

        async fn client_info(&self, client_id: &str) -> Result<ClientInfo, StoreError> {
            self.inner.client_info(client_id).await
        }

        async fn samples(
            &self,
            client_id: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<StoredSample>, StoreError> {
            self.inner.samples(client_id, start, end).await
        }

        async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
            self.inner.purge_older_than(cutoff).await
        }
    }

    fn message(client_id: &str, upload_speed: f64) -> Vec<u8> {
        TelemetryMessage {
            client_id: client_id.to_string(),
            alias: format!("{client_id}-alias"),
            timestamp: Some(Utc::now()),
            upload_speed,
            ..Default::default()
        }
        .encode()
        .unwrap()
    }

    fn setup() -> (Arc<CountingStore>, Ingestor<FakeConnection>) {
        let store = Arc::new(CountingStore::default());
        let ingestor = Ingestor::new(SessionManager::new(Duration::from_secs(300)), store.clone());
        (store, ingestor)
    }

    async fn stored(store: &CountingStore, client_id: &str) -> Vec<StoredSample> {
        let now = Utc::now();
        store
            .samples(client_id, now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn registers_a_client_once_per_connection() {
        let (store, ingestor) = setup();
        let connection = FakeConnection::new(1);
        let mut identity = None;

        for speed in [100.0, 200.0] {
            let outcome = ingestor.ingest(&message("edge", speed), &connection, &mut identity).await.unwrap();
            assert_eq!(outcome, Ingested::Saved);
        }

        assert_eq!(store.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(ingestor.sessions().session_count(), 1);
        assert_eq!(stored(&store, "edge").await.len(), 2);
        assert_eq!(identity.unwrap().alias, "edge-alias");
    }

    #[tokio::test]
    async fn first_identity_sticks() {
        let (store, ingestor) = setup();
        let connection = FakeConnection::new(1);
        let mut identity = None;

        ingestor.ingest(&message("edge", 1.0), &connection, &mut identity).await.unwrap();
        ingestor.ingest(&message("impostor", 2.0), &connection, &mut identity).await.unwrap();

        assert_eq!(stored(&store, "edge").await.len(), 2);
        assert!(matches!(store.client_info("impostor").await, Err(StoreError::UnknownClient(_))));
    }

    #[tokio::test]
    async fn malformed_and_empty_payloads_keep_the_session() {
        let (store, ingestor) = setup();
        let connection = FakeConnection::new(1);
        let mut identity = None;

        ingestor.ingest(&message("edge", 1.0), &connection, &mut identity).await.unwrap();
        let err = ingestor.ingest(b"{not json", &connection, &mut identity).await.unwrap_err();
        assert!(matches!(err, IngestError::Malformed(_)));
        assert_eq!(ingestor.ingest(b"", &connection, &mut identity).await.unwrap(), Ingested::Empty);
        ingestor.ingest(&message("edge", 3.0), &connection, &mut identity).await.unwrap();

        assert!(connection.closes().is_empty());
        assert_eq!(ingestor.sessions().session_count(), 1);
        assert_eq!(stored(&store, "edge").await.len(), 2);
    }

    #[tokio::test]
    async fn rejects_unset_timestamp() {
        let (store, ingestor) = setup();
        let connection = FakeConnection::new(1);
        let mut identity = None;
        let payload = br#"{"client_id":"edge","alias":"a","timestamp":"0001-01-01T00:00:00Z","upload_speed":5}"#;

        let err = ingestor.ingest(payload, &connection, &mut identity).await.unwrap_err();

        assert!(matches!(err, IngestError::UnsetTimestamp(id) if id == "edge"));
        assert!(identity.is_some());
        assert!(stored(&store, "edge").await.is_empty());
    }

    #[tokio::test]
    async fn anonymous_message_does_not_identify() {
        let (store, ingestor) = setup();
        let connection = FakeConnection::new(1);
        let mut identity = None;

        let err = ingestor.ingest(&message("", 1.0), &connection, &mut identity).await.unwrap_err();

        assert!(matches!(err, IngestError::MissingClientId));
        assert!(identity.is_none());
        assert_eq!(store.registrations.load(Ordering::SeqCst), 0);
    }
}
