//! Canvas engine: the process that owns the element store.
//!
//! It serves the HTTP sync API, fans store changes out to connected viewers
//! over WebSocket, and answers the health checks the supervisor polls.

pub mod connection;
pub mod handler;
pub mod hub;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod routes;
pub mod server;
pub mod state;

pub use handler::SyncHandler;
pub use hub::{Hub, Subscription};
pub use server::{build_router, serve, start_engine};
pub use state::EngineState;
