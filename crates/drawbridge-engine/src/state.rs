//! Shared engine state handed to every request handler.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use drawbridge_core::config::Config;
use drawbridge_core::protocol::EngineHealth;

use crate::handler::SyncHandler;

pub struct EngineState {
    pub config: Arc<Config>,
    pub handler: SyncHandler,
    pub started_at: Instant,
}

impl EngineState {
    pub fn new(config: Arc<Config>) -> Self {
        let handler = SyncHandler::new(config.hub.subscriber_buffer, config.engine.sync_enabled);
        Self {
            config,
            handler,
            started_at: Instant::now(),
        }
    }

    /// Liveness report polled by the supervisor.
    pub async fn health(&self) -> EngineHealth {
        EngineHealth {
            status: "healthy".to_string(),
            element_count: self.handler.element_count().await,
            subscriber_count: self.handler.hub().len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        }
    }
}
