//! Calc Relay - JSON-over-TCP calculation service with a caching failover proxy
//!
//! This library provides:
//! - The newline-delimited JSON protocol and its codec
//! - A generic LRU cache engine
//! - A pipelined outbound connection manager
//! - The backend request dispatcher and TCP server
//! - The proxy forwarding engine with UP/DOWN/PROBING backend health

pub mod cache;
pub mod compute;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use cache::{LruCache, SharedCache};
pub use config::RelayConfig;
pub use connection::{Connection, RetryPolicy};
pub use error::{FramingError, ProtocolError, RelayError};
pub use protocol::{Request, Response, Source, Status};
pub use proxy::{BackendHealth, ForwardingEngine, ForwardingOptions};
pub use server::{Dispatcher, DrainState, RelayServer};

/// Result type used throughout the relay
pub type Result<T> = anyhow::Result<T>;
