use std::collections::BTreeMap;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::AppState;
use crate::models::deployment::RollbackReason;

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub version: String,
    pub artifact_ref: String,
    #[serde(default)]
    pub config_snapshot: BTreeMap<String, serde_json::Value>,
}

pub async fn create_deploy(
    State(state): State<AppState>,
    Json(req): Json<DeployRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .controller
        .deploy(&req.version, &req.artifact_ref, req.config_snapshot)
        .await
        .map_err(super::error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "version": req.version, "state": "monitoring" })),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerRollbackRequest {
    /// Optional reason tag; anything unrecognized counts as manual.
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn trigger_rollback(
    State(state): State<AppState>,
    Json(req): Json<TriggerRollbackRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let reason = req
        .reason
        .as_deref()
        .and_then(RollbackReason::parse)
        .unwrap_or(RollbackReason::ManualTrigger);
    let event = state
        .controller
        .trigger_rollback(reason)
        .await
        .map_err(super::error_response)?;
    Ok(Json(serde_json::json!({ "event": event })))
}

pub async fn acknowledge_rollback(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .controller
        .acknowledge_rollback()
        .map_err(super::error_response)?;
    Ok(Json(serde_json::json!({ "state": "stable" })))
}
