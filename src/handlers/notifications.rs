use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::AppState;
use crate::alerting::notification_service::SendTestError;
use crate::models::notification::{AlertNotification, NotificationRequest};

#[derive(Debug, Deserialize)]
pub struct OrgQuery {
    #[serde(default = "crate::models::alert::default_org_id")]
    pub org_id: i64,
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Resolve a request into a notification and make sure its notifier can be built.
fn validated(
    state: &AppState,
    req: NotificationRequest,
    id: i64,
) -> Result<AlertNotification, (StatusCode, String)> {
    let model = req
        .into_notification(id)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    if model.name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "name is required".to_string()));
    }
    state
        .notifications
        .registry()
        .init_notifier(&model)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(model)
}

pub async fn list_notifiers(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "notifiers": state.notifications.registry().plugins() }))
}

pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<OrgQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let notifications = state
        .config_db
        .list_notifications(query.org_id)
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "notifications": notifications })))
}

pub async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let notification = state
        .config_db
        .get_notification(id)
        .map_err(internal)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "notification not found".to_string()))?;
    Ok(Json(notification))
}

pub async fn create_notification(
    State(state): State<AppState>,
    Json(req): Json<NotificationRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let model = validated(&state, req, 0)?;
    if state
        .config_db
        .get_notification_by_uid(model.org_id, &model.uid)
        .map_err(internal)?
        .is_some()
    {
        return Err((
            StatusCode::CONFLICT,
            format!("notification with uid {} already exists", model.uid),
        ));
    }

    let id = state
        .config_db
        .create_notification(&model)
        .map_err(internal)?;
    let created = state
        .config_db
        .get_notification(id)
        .map_err(internal)?
        .ok_or_else(|| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read created notification".to_string(),
            )
        })?;
    tracing::info!(id, name = %created.name, notifier_type = %created.notifier_type, "notification created");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_notification(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(mut req): Json<NotificationRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let existing = state
        .config_db
        .get_notification(id)
        .map_err(internal)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "notification not found".to_string()))?;
    if req.uid.as_deref().is_none_or(str::is_empty) {
        req.uid = Some(existing.uid);
    }
    req.org_id = existing.org_id;

    let model = validated(&state, req, id)?;
    state
        .config_db
        .update_notification(id, &model)
        .map_err(internal)?;
    Ok(Json(model))
}

pub async fn delete_notification(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let deleted = state
        .config_db
        .delete_notification(id)
        .map_err(internal)?;
    if !deleted {
        return Err((StatusCode::NOT_FOUND, "notification not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/alert-notifications/test
pub async fn test_notification(
    State(state): State<AppState>,
    Json(req): Json<NotificationRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let model = req
        .into_notification(0)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    match state.notifications.send_test(&model).await {
        Ok(()) => Ok(Json(serde_json::json!({ "message": "test notification sent" }))),
        Err(SendTestError::Validation(e)) => Err((StatusCode::BAD_REQUEST, e.to_string())),
        Err(e) => {
            tracing::warn!(name = %model.name, "test notification failed: {e}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to send test notification: {e}"),
            ))
        }
    }
}
