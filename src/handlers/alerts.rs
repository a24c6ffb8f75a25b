use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::AppState;
use crate::alerting::engine::EngineError;
use crate::models::alert::*;

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub async fn list_alerts(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let alerts = state.config_db.list_alerts().map_err(internal)?;
    Ok(Json(serde_json::json!({ "alerts": alerts })))
}

pub async fn get_alert(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let alert = state
        .config_db
        .get_alert(id)
        .map_err(internal)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "alert not found".to_string()))?;
    Ok(Json(alert))
}

pub async fn create_alert(
    State(state): State<AppState>,
    Json(req): Json<CreateAlertRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if req.name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "name is required".to_string()));
    }
    if req.for_secs < 0 {
        return Err((StatusCode::BAD_REQUEST, "for_secs must not be negative".to_string()));
    }

    let id = state.config_db.create_alert(&req).map_err(internal)?;
    let alert = state
        .config_db
        .get_alert(id)
        .map_err(internal)?
        .ok_or_else(|| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read created alert".to_string(),
            )
        })?;
    Ok((StatusCode::CREATED, Json(alert)))
}

pub async fn delete_alert(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let deleted = state.config_db.delete_alert(id).map_err(internal)?;
    if !deleted {
        return Err((StatusCode::NOT_FOUND, "alert not found".to_string()));
    }
    state.engine.invalidate(id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pause_alert(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<PauseAlertRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let updated = state
        .config_db
        .set_alert_paused(id, req.paused)
        .map_err(internal)?;
    if !updated {
        return Err((StatusCode::NOT_FOUND, "alert not found".to_string()));
    }
    state.engine.invalidate(id);

    let status = if req.paused { "paused" } else { "unpaused" };
    Ok(Json(serde_json::json!({
        "alert_id": id,
        "state": status,
        "message": format!("alert {status}"),
    })))
}

/// POST /api/v1/alerts/{id}/results: queue an evaluation result for the rule.
pub async fn submit_result(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(mut result): Json<EvalResult>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    result.rule_id = id;
    state.engine.submit(result).map_err(|e| match e {
        EngineError::QueueFull | EngineError::Closed => {
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    })?;
    Ok(StatusCode::ACCEPTED)
}
