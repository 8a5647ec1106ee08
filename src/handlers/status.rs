use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::AppState;

pub async fn get_status(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let report = state.controller.status().map_err(super::error_response)?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let events = state
        .controller
        .recent_events(query.limit.unwrap_or(50))
        .map_err(super::error_response)?;
    Ok(Json(serde_json::json!({ "events": events })))
}
