//! Agent-side HTTP client for the canvas engine.
//!
//! Every call passes the supervisor's availability gate first, so agent
//! commands see `EngineUnavailable` / `EngineFailed` instead of raw
//! connection errors while the engine is down.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use drawbridge_canvas::SceneDocument;
use drawbridge_core::element::Element;
use drawbridge_core::error::{DrawbridgeError, Result};
use drawbridge_core::protocol::{
    ClearResponse, ElementResponse, ElementsResponse, EngineHealth, ErrorResponse, ImportMode,
    ImportResponse, SyncStatus,
};

use crate::supervisor::Supervisor;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct EngineClient {
    http: reqwest::Client,
    base: String,
    supervisor: Option<Arc<Supervisor>>,
}

impl EngineClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DrawbridgeError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            supervisor: None,
        })
    }

    /// Gate every call on `supervisor`.
    pub fn with_supervisor(mut self, supervisor: Arc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn gate(&self) -> Result<()> {
        match &self.supervisor {
            Some(supervisor) => supervisor.ensure_available().await,
            None => Ok(()),
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.gate().await?;
        let resp = request.send().await.map_err(|e| {
            DrawbridgeError::EngineUnavailable(format!("engine request failed: {e}"))
        })?;
        let status = resp.status();
        if status.is_success() {
            return resp
                .json()
                .await
                .map_err(|e| DrawbridgeError::Internal(format!("unreadable engine response: {e}")));
        }
        Err(error_from(resp).await)
    }

    pub async fn health(&self) -> Result<EngineHealth> {
        self.send(self.http.get(self.url("/health"))).await
    }

    pub async fn create_element(&self, element: &Value) -> Result<Element> {
        let resp: ElementResponse = self
            .send(self.http.post(self.url("/api/elements")).json(element))
            .await?;
        Ok(resp.element)
    }

    pub async fn update_element(&self, id: &str, patch: &Value) -> Result<Element> {
        let resp: ElementResponse = self
            .send(self.http.put(self.url(&format!("/api/elements/{id}"))).json(patch))
            .await?;
        Ok(resp.element)
    }

    pub async fn delete_element(&self, id: &str) -> Result<()> {
        let _: Value = self
            .send(self.http.delete(self.url(&format!("/api/elements/{id}"))))
            .await?;
        Ok(())
    }

    pub async fn get_element(&self, id: &str) -> Result<Element> {
        let resp: ElementResponse = self
            .send(self.http.get(self.url(&format!("/api/elements/{id}"))))
            .await?;
        Ok(resp.element)
    }

    pub async fn list_elements(&self) -> Result<Vec<Element>> {
        let resp: ElementsResponse = self.send(self.http.get(self.url("/api/elements"))).await?;
        Ok(resp.elements)
    }

    /// Search by `type` and/or field filters.
    pub async fn query_elements(&self, filters: &[(&str, &str)]) -> Result<Vec<Element>> {
        let resp: ElementsResponse = self
            .send(self.http.get(self.url("/api/elements/search")).query(filters))
            .await?;
        Ok(resp.elements)
    }

    pub async fn batch_create(&self, elements: &[Value]) -> Result<Vec<Element>> {
        let resp: ElementsResponse = self
            .send(
                self.http
                    .post(self.url("/api/elements/batch"))
                    .json(&json!({ "elements": elements })),
            )
            .await?;
        Ok(resp.elements)
    }

    pub async fn import(&self, elements: &[Value], mode: ImportMode) -> Result<ImportResponse> {
        self.send(
            self.http
                .post(self.url("/api/import"))
                .json(&json!({ "elements": elements, "mode": mode })),
        )
        .await
    }

    /// Remove every element. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        let resp: ClearResponse = self.send(self.http.delete(self.url("/api/elements"))).await?;
        Ok(resp.count)
    }

    pub async fn export_svg(&self) -> Result<String> {
        self.gate().await?;
        let resp = self
            .http
            .get(self.url("/api/export/svg"))
            .send()
            .await
            .map_err(|e| DrawbridgeError::EngineUnavailable(format!("engine request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }
        resp.text()
            .await
            .map_err(|e| DrawbridgeError::Internal(format!("unreadable engine response: {e}")))
    }

    pub async fn export_scene(&self) -> Result<SceneDocument> {
        self.send(self.http.get(self.url("/api/export/json"))).await
    }

    pub async fn sync_status(&self) -> Result<SyncStatus> {
        self.send(self.http.get(self.url("/api/sync/status"))).await
    }
}

/// Rebuild the engine's error from a failed response.
async fn error_from(resp: reqwest::Response) -> DrawbridgeError {
    let status = resp.status();
    match resp.json::<ErrorResponse>().await {
        Ok(body) => map_error(status, Some(&body.code), body.error),
        Err(_) => map_error(status, None, status.to_string()),
    }
}

/// Map an engine error back to the variant it was raised from. The error
/// `code` decides; the status is only used when the body carries none.
fn map_error(status: StatusCode, code: Option<&str>, message: String) -> DrawbridgeError {
    match code {
        Some("validation_error") => DrawbridgeError::Validation(message),
        Some("not_found") => DrawbridgeError::NotFound(message),
        Some("empty_canvas") => DrawbridgeError::EmptyCanvas,
        Some("sync_disabled") => DrawbridgeError::SyncDisabled,
        Some(_) => DrawbridgeError::Internal(format!("engine returned {status}: {message}")),
        None => match status {
            StatusCode::BAD_REQUEST => DrawbridgeError::Validation(message),
            StatusCode::NOT_FOUND => DrawbridgeError::NotFound(message),
            StatusCode::FORBIDDEN => DrawbridgeError::SyncDisabled,
            _ => DrawbridgeError::Internal(format!("engine returned {status}: {message}")),
        },
    }
}
