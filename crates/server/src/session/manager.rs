use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::session::types::{ClientSession, ConnectionHandle, SessionInfo, Sessions};

/// Manages identified client sessions and their lifecycle
#[derive(Clone)]
pub struct SessionManager<H> {
    sessions: Sessions<H>,
    timeout: Duration,
}

impl<H: ConnectionHandle> SessionManager<H> {
    /// Creates a new session manager that evicts clients idle for longer than `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Binds `client_id` to `connection`. A session held by another connection is replaced.
    pub fn register(&self, client_id: &str, alias: &str, connection: H) {
        let session = ClientSession::new(client_id.to_string(), alias.to_string(), connection);
        let connection_id = session.connection.id();
        match self.sessions.insert(client_id.to_string(), session) {
            Some(previous) if previous.connection.id() != connection_id => {
                warn!(
                    client_id = client_id,
                    event = "replaced",
                    "Client '{}' reconnected; dropping session of connection {}",
                    client_id, previous.connection.id()
                );
            }
            _ => {
                info!(client_id = client_id, alias = alias, event = "added", "New client session: '{}' ({})", client_id, alias);
            }
        }
    }

    /// Refreshes the last-seen time. Returns false when the client has no session.
    pub fn touch(&self, client_id: &str) -> bool {
        match self.sessions.get_mut(client_id) {
            Some(mut session) => {
                session.touch(Instant::now());
                true
            }
            None => false,
        }
    }

    /// Removes the session only while `connection_id` still owns it.
    pub fn remove_owned(&self, client_id: &str, connection_id: usize) -> bool {
        let removed = self
            .sessions
            .remove_if(client_id, |_, session| session.connection.id() == connection_id)
            .is_some();
        if removed {
            info!(client_id = client_id, event = "disconnect", "Client session removed: '{}'", client_id);
        }
        removed
    }

    /// Closes and removes every session idle for longer than the timeout.
    pub fn cleanup_timeout_sessions(&self, now: Instant) -> usize {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|session| session.idle(now) > self.timeout)
            .map(|session| session.client_id.clone())
            .collect();

        let mut evicted = 0;
        for client_id in stale {
            // A message may have arrived since the scan.
            let removed = self
                .sessions
                .remove_if(&client_id, |_, session| session.idle(now) > self.timeout);
            if let Some((_, session)) = removed {
                warn!(
                    client_id = client_id.as_str(),
                    event = "timeout",
                    "Client '{}' idle for {:?}; closing connection",
                    client_id,
                    session.idle(now)
                );
                session.connection.close("inactive timeout");
                evicted += 1;
            }
        }
        debug!(
            histogram.live_sessions = self.sessions.len() as u64,
            monotonic_counter.sessions_evicted = evicted as u64,
            "{} client sessions live after sweep", self.sessions.len()
        );
        evicted
    }

    /// Closes and forgets every session.
    pub fn close_all(&self, reason: &'static str) {
        let client_ids: Vec<String> = self.sessions.iter().map(|session| session.key().clone()).collect();
        for client_id in client_ids {
            if let Some((_, session)) = self.sessions.remove(&client_id) {
                session.connection.close(reason);
            }
        }
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        self.sessions
            .iter()
            .map(|session| SessionInfo {
                client_id: session.client_id.clone(),
                alias: session.alias.clone(),
                idle: session.idle(now),
                connected_for: now.saturating_duration_since(session.connected_at),
            })
            .collect()
    }

    /// Gets the number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
