//! HTTP surface of the engine.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tracing::error;

use drawbridge_canvas::{ElementQuery, ExportOptions};
use drawbridge_core::error::DrawbridgeError;
use drawbridge_core::protocol::{
    ClearResponse, DeleteResponse, ElementResponse, ElementsResponse, ErrorResponse, ImportMode,
};

use crate::state::EngineState;

type AppState = State<Arc<EngineState>>;
type ApiResult<T> = Result<T, ApiError>;

/// A [`DrawbridgeError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub DrawbridgeError);

impl From<DrawbridgeError> for ApiError {
    fn from(err: DrawbridgeError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(DrawbridgeError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            DrawbridgeError::Validation(_) => StatusCode::BAD_REQUEST,
            DrawbridgeError::NotFound(_) | DrawbridgeError::EmptyCanvas => StatusCode::NOT_FOUND,
            DrawbridgeError::SyncDisabled => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "Request failed");
            "Internal server error".to_string()
        } else {
            err.to_string()
        };
        let body = ErrorResponse {
            success: false,
            error: message,
            code: err.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Pull a required array field out of a request body.
fn elements_field(body: &Value) -> Result<&[Value], DrawbridgeError> {
    body.get("elements")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| DrawbridgeError::Validation("'elements' must be an array".into()))
}

pub async fn health(State(state): AppState) -> impl IntoResponse {
    Json(state.health().await)
}

pub async fn list_elements(State(state): AppState) -> impl IntoResponse {
    Json(ElementsResponse::new(state.handler.list().await))
}

pub async fn create_element(
    State(state): AppState,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body?;
    let element = state.handler.create(&body).await?;
    Ok(Json(ElementResponse {
        success: true,
        element,
    }))
}

pub async fn get_element(
    State(state): AppState,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let element = state.handler.get(&id).await?;
    Ok(Json(ElementResponse {
        success: true,
        element,
    }))
}

pub async fn update_element(
    State(state): AppState,
    Path(id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body?;
    let element = state.handler.update(&id, &body).await?;
    Ok(Json(ElementResponse {
        success: true,
        element,
    }))
}

pub async fn delete_element(
    State(state): AppState,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.handler.delete(&id).await?;
    Ok(Json(DeleteResponse { success: true, id }))
}

pub async fn clear_elements(State(state): AppState) -> impl IntoResponse {
    let count = state.handler.clear().await;
    Json(ClearResponse {
        success: true,
        count,
    })
}

pub async fn search_elements(
    State(state): AppState,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<impl IntoResponse> {
    let query = ElementQuery::from_params(params)?;
    Ok(Json(ElementsResponse::new(state.handler.query(&query).await)))
}

pub async fn batch_create(
    State(state): AppState,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body?;
    let elements = state.handler.batch_create(elements_field(&body)?).await?;
    Ok(Json(ElementsResponse::new(elements)))
}

pub async fn sync_elements(
    State(state): AppState,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body?;
    let timestamp = body.get("timestamp").and_then(Value::as_str);
    let out = state
        .handler
        .full_sync(elements_field(&body)?, timestamp)
        .await?;
    Ok(Json(out))
}

/// Accepts `{elements, mode?}`; a scene document also has that shape.
pub async fn import_scene(
    State(state): AppState,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body?;
    let mode = match body.get("mode") {
        None | Some(Value::Null) => ImportMode::default(),
        Some(raw) => serde_json::from_value(raw.clone()).map_err(|_| {
            DrawbridgeError::Validation(format!("unknown import mode {raw}"))
        })?,
    };
    let out = state.handler.import(elements_field(&body)?, mode).await?;
    Ok(Json(out))
}

pub async fn export_svg(
    State(state): AppState,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<impl IntoResponse> {
    let mut options = ExportOptions::default();
    match params.get("background").map(String::as_str) {
        Some("none") | Some("transparent") => options.background = None,
        Some(color) => options.background = Some(color.to_string()),
        None => {}
    }
    let svg = state.handler.export_svg(&options).await?;
    Ok(([(header::CONTENT_TYPE, "image/svg+xml")], svg))
}

pub async fn export_json(State(state): AppState) -> ApiResult<impl IntoResponse> {
    let scene = state.handler.export_scene().await?;
    Ok((
        [(
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"canvas.excalidraw\"",
        )],
        Json(scene),
    ))
}

pub async fn scene(State(state): AppState) -> impl IntoResponse {
    Json(state.handler.scene().await)
}

pub async fn sync_status(State(state): AppState) -> impl IntoResponse {
    Json(state.handler.sync_status().await)
}
