use serde::{Deserialize, Serialize};

/// Audit record of one alert state transition.
#[derive(Debug, Clone, Serialize)]
pub struct Annotation {
    pub id: i64,
    pub org_id: i64,
    pub dashboard_id: i64,
    pub panel_id: i64,
    pub alert_id: i64,
    pub text: String,
    pub new_state: String,
    pub prev_state: String,
    /// Milliseconds since the unix epoch.
    pub epoch: i64,
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct AnnotationQuery {
    pub alert_id: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}
