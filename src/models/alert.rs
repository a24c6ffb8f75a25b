use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Pending,
    Alerting,
    Ok,
    NoData,
    ExecError,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Pending => "pending",
            AlertState::Alerting => "alerting",
            AlertState::Ok => "ok",
            AlertState::NoData => "no_data",
            AlertState::ExecError => "exec_error",
        }
    }

    pub fn is_ok_or_pending(&self) -> bool {
        matches!(self, AlertState::Ok | AlertState::Pending)
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AlertState::Pending),
            "alerting" => Ok(AlertState::Alerting),
            "ok" => Ok(AlertState::Ok),
            "no_data" => Ok(AlertState::NoData),
            "exec_error" => Ok(AlertState::ExecError),
            other => anyhow::bail!("unknown alert state: {other}"),
        }
    }
}

/// Presentation of a state in notifications.
#[derive(Debug, Clone, Serialize)]
pub struct StateModel {
    pub color: &'static str,
    pub text: &'static str,
}

impl AlertState {
    pub fn model(&self) -> StateModel {
        let (color, text) = match self {
            AlertState::Ok => ("#36a64f", "OK"),
            AlertState::NoData => ("#888888", "No Data"),
            AlertState::Alerting => ("#D63232", "Alerting"),
            AlertState::Pending => ("#888888", "Pending"),
            AlertState::ExecError => ("#D63232", "Execution Error"),
        };
        StateModel { color, text }
    }
}

/// What to do when the evaluator reports no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoDataOption {
    #[default]
    NoData,
    Alerting,
    Ok,
    KeepState,
}

impl NoDataOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoDataOption::NoData => "no_data",
            NoDataOption::Alerting => "alerting",
            NoDataOption::Ok => "ok",
            NoDataOption::KeepState => "keep_state",
        }
    }
}

impl FromStr for NoDataOption {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_data" => Ok(NoDataOption::NoData),
            "alerting" => Ok(NoDataOption::Alerting),
            "ok" => Ok(NoDataOption::Ok),
            "keep_state" => Ok(NoDataOption::KeepState),
            other => anyhow::bail!("unknown no_data_state: {other}"),
        }
    }
}

/// What to do when the evaluator reports an execution error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorOption {
    #[default]
    Alerting,
    KeepState,
    ExecError,
}

impl ExecutionErrorOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionErrorOption::Alerting => "alerting",
            ExecutionErrorOption::KeepState => "keep_state",
            ExecutionErrorOption::ExecError => "exec_error",
        }
    }
}

impl FromStr for ExecutionErrorOption {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alerting" => Ok(ExecutionErrorOption::Alerting),
            "keep_state" => Ok(ExecutionErrorOption::KeepState),
            "exec_error" => Ok(ExecutionErrorOption::ExecError),
            other => anyhow::bail!("unknown execution_error_state: {other}"),
        }
    }
}

/// One series that matched the rule condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalMatch {
    pub metric: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Alert rule as held in memory between evaluations.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRule {
    pub id: i64,
    pub org_id: i64,
    pub dashboard_id: i64,
    pub dashboard_uid: String,
    pub dashboard_slug: String,
    pub panel_id: i64,
    pub name: String,
    pub message: String,
    pub state: AlertState,
    pub paused: bool,
    pub for_secs: i64,
    pub no_data_state: NoDataOption,
    pub execution_error_state: ExecutionErrorOption,
    /// Uids of the notifications attached to this rule.
    pub notifications: Vec<String>,
    pub alert_rule_tags: Vec<Tag>,
    pub state_changes: i64,
    pub last_state_change: DateTime<Utc>,
}

/// Persisted alert row, including the last evaluation snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    #[serde(flatten)]
    pub rule: AlertRule,
    pub execution_error: String,
    pub eval_data: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct SetAlertStateCommand {
    pub alert_id: i64,
    pub org_id: i64,
    pub state: AlertState,
    pub error: String,
    pub eval_data: serde_json::Value,
    /// Write even when the stored state already equals `state`.
    pub force: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AlertStateUpdate {
    pub state_changes: i64,
    pub new_state_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAlertRequest {
    #[serde(default = "default_org_id")]
    pub org_id: i64,
    #[serde(default)]
    pub dashboard_id: i64,
    #[serde(default)]
    pub dashboard_uid: String,
    #[serde(default)]
    pub dashboard_slug: String,
    #[serde(default)]
    pub panel_id: i64,
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub for_secs: i64,
    #[serde(default)]
    pub no_data_state: NoDataOption,
    #[serde(default)]
    pub execution_error_state: ExecutionErrorOption,
    #[serde(default)]
    pub notifications: Vec<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
pub struct PauseAlertRequest {
    pub paused: bool,
}

/// Raw outcome of one evaluation pass, as produced by the rule evaluator.
#[derive(Debug, Clone, Deserialize)]
pub struct EvalResult {
    #[serde(default)]
    pub rule_id: i64,
    #[serde(default)]
    pub firing: bool,
    #[serde(default)]
    pub no_data_found: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub eval_matches: Vec<EvalMatch>,
    #[serde(default = "Utc::now")]
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub force_state_update: bool,
}

pub fn default_org_id() -> i64 {
    1
}
