use thiserror::Error;

#[derive(Debug, Error)]
pub enum DrawbridgeError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Element not found: {0}")]
    NotFound(String),

    #[error("Canvas is empty, nothing to export")]
    EmptyCanvas,

    #[error("Canvas sync is disabled")]
    SyncDisabled,

    #[error("Canvas engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Canvas engine failed permanently: {0}")]
    EngineFailed(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DrawbridgeError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::EmptyCanvas => "empty_canvas",
            Self::SyncDisabled => "sync_disabled",
            Self::EngineUnavailable(_) => "engine_unavailable",
            Self::EngineFailed(_) => "engine_failed",
            Self::Process(_) => "process_error",
            Self::Internal(_) | Self::Io(_) | Self::Json(_) | Self::Other(_) => "internal_error",
        }
    }

    /// Only a temporarily unreachable engine is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::EngineUnavailable(_))
    }

    /// True for errors caused by the caller's input rather than by the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::EmptyCanvas | Self::SyncDisabled
        )
    }
}

pub type Result<T> = std::result::Result<T, DrawbridgeError>;
