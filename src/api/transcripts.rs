//! Conversation transcript endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::get,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiState, auth::require_api_key};
use crate::db::TranscriptSummary;
use crate::voice::TranscriptRecord;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, code: &str, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: message.to_string(),
            },
        }),
    )
}

fn db_error(e: &crate::Error) -> ApiError {
    tracing::error!(error = %e, "transcript query failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error", &e.to_string())
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid_id", "Invalid transcript id"))
}

/// Most recent transcripts
async fn list_transcripts(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TranscriptSummary>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let summaries = state.transcripts.list_recent(limit).map_err(|e| db_error(&e))?;
    Ok(Json(summaries))
}

/// One transcript with its entries
async fn get_transcript(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<TranscriptRecord>, ApiError> {
    let id = parse_id(&id)?;
    let record = state
        .transcripts
        .get(id)
        .map_err(|e| db_error(&e))?
        .ok_or_else(|| {
            error_response(StatusCode::NOT_FOUND, "not_found", "Transcript not found")
        })?;
    Ok(Json(record))
}

/// Every transcript recorded for a session
async fn list_session_transcripts(
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<TranscriptRecord>>, ApiError> {
    let session_id = parse_id(&session_id)?;
    let records = state
        .transcripts
        .list_for_session(session_id)
        .map_err(|e| db_error(&e))?;
    Ok(Json(records))
}

/// Build transcripts router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_transcripts))
        .route("/{id}", get(get_transcript))
        .route("/session/{session_id}", get(list_session_transcripts))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}
