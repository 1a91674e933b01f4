mod connection;
mod manager;
mod types;

pub use connection::{handle_connection, Identity, IngestError, Ingested, Ingestor, READ_DEADLINE};
pub use manager::SessionManager;
pub use types::{ClientSession, ConnectionHandle, SessionInfo, Sessions};
