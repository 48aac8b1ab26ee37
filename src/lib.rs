// EventFlow - asynchronous analytical query server
// Core library module

pub mod cache;
pub mod config;
pub mod coordination;
pub mod error;
pub mod executor;
pub mod identity;
pub mod queries;
pub mod server;
pub mod state;
pub mod warehouse;

pub use config::ServerConfig;
pub use error::{FlowError, Result};
pub use identity::QueryId;

/// Crate version reported by the server banner and the `/run` response headers.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
