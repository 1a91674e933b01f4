use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use quinn::VarInt;
use tokio::time::Instant;

/// The part of a transport connection the session registry needs.
pub trait ConnectionHandle: Clone + Send + Sync + 'static {
    /// Identifier that stays stable for the lifetime of the connection.
    fn id(&self) -> usize;

    /// Closes the connection; closing twice is harmless.
    fn close(&self, reason: &'static str);
}

impl ConnectionHandle for quinn::Connection {
    fn id(&self) -> usize {
        self.stable_id()
    }

    fn close(&self, reason: &'static str) {
        quinn::Connection::close(self, VarInt::from_u32(0), reason.as_bytes());
    }
}

/// An identified client bound to the connection it reports over.
#[derive(Debug)]
pub struct ClientSession<H> {
    pub client_id: String,
    pub alias: String,
    pub connection: H,
    /// When the last telemetry message was accepted for this client
    pub last_seen: Instant,
    pub connected_at: Instant,
}

impl<H: ConnectionHandle> ClientSession<H> {
    pub fn new(client_id: String, alias: String, connection: H) -> Self {
        let now = Instant::now();
        Self {
            client_id,
            alias,
            connection,
            last_seen: now,
            connected_at: now,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// Point-in-time view of one connected client.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub client_id: String,
    pub alias: String,
    pub idle: Duration,
    pub connected_for: Duration,
}

/// Thread-safe registry of identified clients, keyed by client id
pub type Sessions<H> = Arc<DashMap<String, ClientSession<H>>>;
