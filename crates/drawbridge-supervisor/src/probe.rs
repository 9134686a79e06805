//! Engine health probing.

use std::time::Duration;

use async_trait::async_trait;

use drawbridge_core::error::{DrawbridgeError, Result};
use drawbridge_core::protocol::EngineHealth;

/// One health check against the engine. Implementations must bound their
/// own duration; a probe that times out is a failed probe.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<EngineHealth>;
}

/// Polls `GET {base}/health`.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DrawbridgeError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: format!("{}/health", base_url.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> Result<EngineHealth> {
        let resp = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                DrawbridgeError::EngineUnavailable("health probe timed out".into())
            } else {
                DrawbridgeError::EngineUnavailable(format!("health probe failed: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DrawbridgeError::EngineUnavailable(format!(
                "health endpoint returned {status}"
            )));
        }

        let health: EngineHealth = resp.json().await.map_err(|e| {
            DrawbridgeError::EngineUnavailable(format!("unreadable health response: {e}"))
        })?;
        if !health.is_healthy() {
            return Err(DrawbridgeError::EngineUnavailable(format!(
                "engine reports status '{}'",
                health.status
            )));
        }
        Ok(health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_url() {
        let probe = HttpHealthProbe::new("http://127.0.0.1:3031/", Duration::from_secs(1)).unwrap();
        assert_eq!(probe.url(), "http://127.0.0.1:3031/health");
    }

    #[tokio::test]
    async fn test_unreachable_engine_fails() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe =
            HttpHealthProbe::new(&format!("http://127.0.0.1:{port}"), Duration::from_millis(500))
                .unwrap();
        let err = probe.probe().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
