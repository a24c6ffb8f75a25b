use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::AppState;

pub async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "renderer": state.renderer.health(),
    }))
}
