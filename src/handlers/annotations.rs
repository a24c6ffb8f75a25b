use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::AppState;
use crate::models::annotation::AnnotationQuery;

pub async fn list_annotations(
    State(state): State<AppState>,
    Query(query): Query<AnnotationQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let query = AnnotationQuery {
        limit: query.limit.clamp(1, 1000),
        ..query
    };
    let annotations = state
        .config_db
        .list_annotations(&query)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "annotations": annotations })))
}
