//! Drawbridge wire protocol.
//!
//! Viewers receive [`CanvasEvent`] frames as JSON text over the real-time
//! channel. HTTP handlers answer with the envelopes defined below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::element::Element;

/// Events pushed to connected viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanvasEvent {
    /// Full snapshot, sent once right after a viewer connects.
    InitialElements { elements: Vec<Element> },
    /// Store summary, sent right after the snapshot.
    #[serde(rename_all = "camelCase")]
    SyncStatus {
        element_count: usize,
        timestamp: DateTime<Utc>,
    },
    ElementCreated { element: Element },
    ElementUpdated { element: Element },
    #[serde(rename_all = "camelCase")]
    ElementDeleted { element_id: String },
    ElementsBatchCreated { elements: Vec<Element> },
    ElementsSynced {
        count: usize,
        skipped: usize,
        timestamp: DateTime<Utc>,
        source: String,
        elements: Vec<Element>,
    },
    ElementsImported {
        count: usize,
        skipped: usize,
        mode: ImportMode,
        elements: Vec<Element>,
    },
    ElementsCleared { count: usize },
    /// Reply to a viewer's `ping`.
    Pong,
}

impl CanvasEvent {
    /// The `type` tag, for logging and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitialElements { .. } => "initial_elements",
            Self::SyncStatus { .. } => "sync_status",
            Self::ElementCreated { .. } => "element_created",
            Self::ElementUpdated { .. } => "element_updated",
            Self::ElementDeleted { .. } => "element_deleted",
            Self::ElementsBatchCreated { .. } => "elements_batch_created",
            Self::ElementsSynced { .. } => "elements_synced",
            Self::ElementsImported { .. } => "elements_imported",
            Self::ElementsCleared { .. } => "elements_cleared",
            Self::Pong => "pong",
        }
    }
}

/// Frames viewers may send to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerMessage {
    Ping,
}

/// How an import treats the existing canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    #[default]
    Merge,
    Replace,
}

/// Per-item failure in a bulk operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub index: usize,
    pub error: String,
}

/// Response envelope for single-element operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementResponse {
    pub success: bool,
    pub element: Element,
}

/// Response envelope for multi-element reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementsResponse {
    pub success: bool,
    pub elements: Vec<Element>,
    pub count: usize,
}

impl ElementsResponse {
    pub fn new(elements: Vec<Element>) -> Self {
        Self {
            success: true,
            count: elements.len(),
            elements,
        }
    }
}

/// Response for delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub id: String,
}

/// Response for full sync: counts of what was applied and what was skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub count: usize,
    pub skipped: usize,
    pub before_count: usize,
    pub after_count: usize,
    pub errors: Vec<ItemError>,
    pub timestamp: DateTime<Utc>,
}

/// Response for import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResponse {
    pub success: bool,
    pub count: usize,
    pub skipped: usize,
    pub mode: ImportMode,
    pub errors: Vec<ItemError>,
    pub elements: Vec<Element>,
}

/// Response for clear-all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearResponse {
    pub success: bool,
    pub count: usize,
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
}

/// `GET /api/sync/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub success: bool,
    pub element_count: usize,
    pub subscriber_count: usize,
    pub sync_enabled: bool,
    pub timestamp: DateTime<Utc>,
}

/// `GET /health`, the contract the supervisor polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub status: String,
    pub element_count: usize,
    pub subscriber_count: usize,
    pub uptime_secs: u64,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

impl EngineHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}
