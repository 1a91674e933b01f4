pub mod config;
pub mod listener;
pub mod session;
pub mod store;

pub use listener::Collector;
pub use store::{MemoryStore, Persistence};
