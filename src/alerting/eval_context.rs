use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::models::alert::{
    AlertRule, AlertState, EvalMatch, EvalResult, ExecutionErrorOption, NoDataOption, StateModel,
};

/// Outcome of the result handler's state write for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateWrite {
    #[default]
    Skipped,
    Committed,
    /// A concurrent writer already moved the state.
    Stale,
    Paused,
    Failed,
}

/// One evaluation pass of a rule.
#[derive(Debug, Clone)]
pub struct EvalContext {
    /// In-memory rule. `rule.state` is the state computed for this pass.
    pub rule: AlertRule,
    pub prev_alert_state: AlertState,
    pub eval_matches: Vec<EvalMatch>,
    pub error: Option<String>,
    pub no_data_found: bool,
    pub firing: bool,
    pub start_time: DateTime<Utc>,
    pub image_public_url: Option<String>,
    pub image_on_disk_path: Option<PathBuf>,
    pub is_test_run: bool,
    pub force_state_update: bool,
    pub app_url: String,
    pub state_write: StateWrite,
}

impl EvalContext {
    pub fn new(rule: AlertRule, app_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            prev_alert_state: rule.state,
            rule,
            eval_matches: Vec::new(),
            error: None,
            no_data_found: false,
            firing: false,
            start_time: now,
            image_public_url: None,
            image_on_disk_path: None,
            is_test_run: false,
            force_state_update: false,
            app_url: app_url.into(),
            state_write: StateWrite::Skipped,
        }
    }

    /// Build a context from evaluator output and compute the new state.
    pub fn from_result(rule: AlertRule, result: EvalResult, app_url: impl Into<String>) -> Self {
        let mut ctx = Self::new(rule, app_url);
        ctx.firing = result.firing;
        ctx.no_data_found = result.no_data_found;
        ctx.error = result.error.filter(|e| !e.is_empty());
        ctx.eval_matches = result.eval_matches;
        ctx.start_time = result.start_time;
        ctx.force_state_update = result.force_state_update;
        ctx.rule.state = ctx.new_state();
        ctx
    }

    pub fn current_state(&self) -> AlertState {
        self.rule.state
    }

    pub fn new_state(&self) -> AlertState {
        let state = self.new_state_internal();
        if state != AlertState::Alerting || self.rule.for_secs <= 0 {
            return state;
        }

        let since = Utc::now() - self.rule.last_state_change;
        match self.prev_alert_state {
            AlertState::Alerting => AlertState::Alerting,
            AlertState::Pending if since > chrono::Duration::seconds(self.rule.for_secs) => {
                AlertState::Alerting
            }
            _ => AlertState::Pending,
        }
    }

    fn new_state_internal(&self) -> AlertState {
        if let Some(err) = &self.error {
            tracing::error!(rule_id = self.rule.id, error = %err, "alert rule result error");
            return match self.rule.execution_error_state {
                ExecutionErrorOption::KeepState => self.prev_alert_state,
                ExecutionErrorOption::ExecError => AlertState::ExecError,
                ExecutionErrorOption::Alerting => AlertState::Alerting,
            };
        }

        if self.firing {
            return AlertState::Alerting;
        }

        if self.no_data_found {
            tracing::info!(rule_id = self.rule.id, "alert rule returned no data");
            return match self.rule.no_data_state {
                NoDataOption::KeepState => self.prev_alert_state,
                NoDataOption::NoData => AlertState::NoData,
                NoDataOption::Alerting => AlertState::Alerting,
                NoDataOption::Ok => AlertState::Ok,
            };
        }

        AlertState::Ok
    }

    pub fn should_update_alert_state(&self) -> bool {
        self.rule.state != self.prev_alert_state || self.force_state_update
    }

    pub fn state_model(&self) -> StateModel {
        self.rule.state.model()
    }

    pub fn notification_title(&self) -> String {
        format!("[{}] {}", self.state_model().text, self.rule.name)
    }

    pub fn rule_url(&self) -> String {
        if self.is_test_run {
            return self.app_url.clone();
        }
        if self.rule.dashboard_uid.is_empty() {
            return format!("{}alerting/list", self.app_url);
        }
        format!(
            "{}d/{}/{}?fullscreen&edit&tab=alert&panelId={}&orgId={}",
            self.app_url,
            urlencoding::encode(&self.rule.dashboard_uid),
            urlencoding::encode(&self.rule.dashboard_slug),
            self.rule.panel_id,
            self.rule.org_id,
        )
    }

    /// Path of the panel to render for notification images.
    pub fn panel_render_path(&self) -> String {
        format!(
            "d-solo/{}/{}?orgId={}&panelId={}",
            self.rule.dashboard_uid, self.rule.dashboard_slug, self.rule.org_id, self.rule.panel_id
        )
    }

    /// Snapshot stored with the state write and the annotation.
    pub fn eval_data(&self) -> serde_json::Value {
        let mut data = serde_json::Map::new();
        if !self.eval_matches.is_empty() {
            data.insert(
                "evalMatches".into(),
                serde_json::to_value(&self.eval_matches).unwrap_or_default(),
            );
        }
        if let Some(err) = &self.error {
            data.insert("error".into(), serde_json::Value::String(err.clone()));
        } else if self.no_data_found {
            data.insert("noData".into(), serde_json::Value::Bool(true));
        }
        serde_json::Value::Object(data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    pub(crate) fn test_rule(state: AlertState) -> AlertRule {
        AlertRule {
            id: 7,
            org_id: 1,
            dashboard_id: 3,
            dashboard_uid: "abc123".into(),
            dashboard_slug: "api-latency".into(),
            panel_id: 2,
            name: "High latency".into(),
            message: "p99 above budget".into(),
            state,
            paused: false,
            for_secs: 0,
            no_data_state: NoDataOption::NoData,
            execution_error_state: ExecutionErrorOption::Alerting,
            notifications: vec!["ops".into()],
            alert_rule_tags: vec![],
            state_changes: 4,
            last_state_change: Utc::now(),
        }
    }

    pub(crate) fn transition(prev: AlertState, next: AlertState) -> EvalContext {
        let mut ctx = EvalContext::new(test_rule(prev), "http://localhost:3000/");
        ctx.rule.state = next;
        ctx
    }

    fn result(firing: bool) -> EvalResult {
        EvalResult {
            rule_id: 7,
            firing,
            no_data_found: false,
            error: None,
            eval_matches: vec![],
            start_time: Utc::now(),
            force_state_update: false,
        }
    }

    #[test]
    fn test_new_state_basic() {
        let ctx = EvalContext::from_result(test_rule(AlertState::Ok), result(true), "");
        assert_eq!(ctx.current_state(), AlertState::Alerting);
        assert_eq!(ctx.prev_alert_state, AlertState::Ok);
        assert!(ctx.should_update_alert_state());

        let ctx = EvalContext::from_result(test_rule(AlertState::Ok), result(false), "");
        assert_eq!(ctx.current_state(), AlertState::Ok);
        assert!(!ctx.should_update_alert_state());
    }

    #[test]
    fn test_new_state_error_options() {
        let mut r = result(false);
        r.error = Some("timeout".into());

        let ctx = EvalContext::from_result(test_rule(AlertState::Ok), r.clone(), "");
        assert_eq!(ctx.current_state(), AlertState::Alerting);

        let mut rule = test_rule(AlertState::Ok);
        rule.execution_error_state = ExecutionErrorOption::KeepState;
        let ctx = EvalContext::from_result(rule, r.clone(), "");
        assert_eq!(ctx.current_state(), AlertState::Ok);

        let mut rule = test_rule(AlertState::Ok);
        rule.execution_error_state = ExecutionErrorOption::ExecError;
        let ctx = EvalContext::from_result(rule, r, "");
        assert_eq!(ctx.current_state(), AlertState::ExecError);
    }

    #[test]
    fn test_new_state_no_data_options() {
        let mut r = result(false);
        r.no_data_found = true;

        let ctx = EvalContext::from_result(test_rule(AlertState::Alerting), r.clone(), "");
        assert_eq!(ctx.current_state(), AlertState::NoData);

        let mut rule = test_rule(AlertState::Alerting);
        rule.no_data_state = NoDataOption::KeepState;
        let ctx = EvalContext::from_result(rule, r.clone(), "");
        assert_eq!(ctx.current_state(), AlertState::Alerting);

        let mut rule = test_rule(AlertState::Alerting);
        rule.no_data_state = NoDataOption::Ok;
        let ctx = EvalContext::from_result(rule, r, "");
        assert_eq!(ctx.current_state(), AlertState::Ok);
    }

    #[test]
    fn test_new_state_with_for_duration() {
        let mut rule = test_rule(AlertState::Ok);
        rule.for_secs = 300;
        let ctx = EvalContext::from_result(rule, result(true), "");
        assert_eq!(ctx.current_state(), AlertState::Pending);

        let mut rule = test_rule(AlertState::Pending);
        rule.for_secs = 300;
        let ctx = EvalContext::from_result(rule.clone(), result(true), "");
        assert_eq!(ctx.current_state(), AlertState::Pending);

        rule.last_state_change = Utc::now() - chrono::Duration::seconds(301);
        let ctx = EvalContext::from_result(rule, result(true), "");
        assert_eq!(ctx.current_state(), AlertState::Alerting);

        let mut rule = test_rule(AlertState::Alerting);
        rule.for_secs = 300;
        let ctx = EvalContext::from_result(rule, result(true), "");
        assert_eq!(ctx.current_state(), AlertState::Alerting);
    }

    #[test]
    fn test_forced_update() {
        let mut r = result(false);
        r.force_state_update = true;
        let ctx = EvalContext::from_result(test_rule(AlertState::Ok), r, "");
        assert!(ctx.should_update_alert_state());
    }

    #[test]
    fn test_eval_data_snapshot() {
        let mut ctx = transition(AlertState::Ok, AlertState::Alerting);
        assert_eq!(ctx.eval_data(), serde_json::json!({}));

        ctx.no_data_found = true;
        assert_eq!(ctx.eval_data(), serde_json::json!({"noData": true}));

        ctx.error = Some("boom".into());
        ctx.eval_matches.push(EvalMatch {
            metric: "cpu".into(),
            tags: BTreeMap::new(),
            value: Some(1.5),
        });
        let data = ctx.eval_data();
        assert_eq!(data["error"], "boom");
        assert!(data.get("noData").is_none());
        assert_eq!(data["evalMatches"][0]["metric"], "cpu");
    }

    #[test]
    fn test_title_and_rule_url() {
        let mut ctx = transition(AlertState::Ok, AlertState::Alerting);
        assert_eq!(ctx.notification_title(), "[Alerting] High latency");
        assert_eq!(
            ctx.rule_url(),
            "http://localhost:3000/d/abc123/api-latency?fullscreen&edit&tab=alert&panelId=2&orgId=1"
        );

        ctx.rule.dashboard_uid.clear();
        assert_eq!(ctx.rule_url(), "http://localhost:3000/alerting/list");

        ctx.is_test_run = true;
        assert_eq!(ctx.rule_url(), "http://localhost:3000/");
    }
}
