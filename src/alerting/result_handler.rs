//! Turns one evaluation into a persisted state transition, an annotation and
//! a notification pass.

use chrono::Utc;
use std::sync::Arc;

use crate::alerting::eval_context::{EvalContext, StateWrite};
use crate::alerting::notification_service::NotificationDispatcher;
use crate::alerting::store::{AlertStateStore, AnnotationStore, SetAlertStateError};
use crate::metrics::ALERTING_RESULT_TOTAL;
use crate::models::alert::SetAlertStateCommand;
use crate::models::annotation::Annotation;

pub struct ResultHandler {
    state_store: Arc<dyn AlertStateStore>,
    annotations: Arc<dyn AnnotationStore>,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl ResultHandler {
    pub fn new(
        state_store: Arc<dyn AlertStateStore>,
        annotations: Arc<dyn AnnotationStore>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            state_store,
            annotations,
            notifier,
        }
    }

    /// Only a paused rule is reported as an error. Storage failures are
    /// logged and the annotation and notification pass still run.
    pub async fn handle(&self, ctx: &mut EvalContext) -> Result<(), SetAlertStateError> {
        let eval_data = ctx.eval_data();
        let exec_error = ctx.error.clone().unwrap_or_default();

        metrics::counter!(ALERTING_RESULT_TOTAL, "state" => ctx.rule.state.as_str()).increment(1);

        if ctx.should_update_alert_state() {
            tracing::info!(
                rule_id = ctx.rule.id,
                prev_state = %ctx.prev_alert_state,
                new_state = %ctx.rule.state,
                "new state change"
            );

            let cmd = SetAlertStateCommand {
                alert_id: ctx.rule.id,
                org_id: ctx.rule.org_id,
                state: ctx.rule.state,
                error: exec_error,
                eval_data: eval_data.clone(),
                force: ctx.force_state_update,
            };

            match self.state_store.set_alert_state(&cmd) {
                Ok(update) => {
                    ctx.rule.state_changes = update.state_changes;
                    ctx.rule.last_state_change = update.new_state_date;
                    ctx.state_write = StateWrite::Committed;
                }
                Err(SetAlertStateError::Paused) => {
                    tracing::debug!(rule_id = ctx.rule.id, "cannot change state on a paused alert rule");
                    ctx.state_write = StateWrite::Paused;
                    return Err(SetAlertStateError::Paused);
                }
                // TODO: decide whether a stale pass should still run notifications.
                Err(SetAlertStateError::RequiresNewState) => {
                    tracing::info!(rule_id = ctx.rule.id, "alert already updated");
                    ctx.state_write = StateWrite::Stale;
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(rule_id = ctx.rule.id, "failed to save state: {e}");
                    ctx.state_write = StateWrite::Failed;
                }
            }

            let annotation = Annotation {
                id: 0,
                org_id: ctx.rule.org_id,
                dashboard_id: ctx.rule.dashboard_id,
                panel_id: ctx.rule.panel_id,
                alert_id: ctx.rule.id,
                text: String::new(),
                new_state: ctx.rule.state.as_str().to_string(),
                prev_state: ctx.prev_alert_state.as_str().to_string(),
                epoch: Utc::now().timestamp_millis(),
                data: eval_data,
            };
            if let Err(e) = self.annotations.save_annotation(&annotation) {
                tracing::error!(rule_id = ctx.rule.id, "failed to save annotation for new alert state: {e}");
            }
        }

        self.notifier.send_if_needed(ctx).await;
        Ok(())
    }
}
