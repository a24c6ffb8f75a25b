//! Persistence seams used by the alerting pipeline.
//!
//! `ConfigDb` implements all of them; tests substitute spies.

use crate::models::alert::{AlertStateUpdate, SetAlertStateCommand};
use crate::models::annotation::Annotation;
use crate::models::notification::{
    AlertNotification, AlertNotificationState, SetNotificationPendingCommand,
};

#[derive(Debug, thiserror::Error)]
pub enum SetAlertStateError {
    #[error("cannot change state on a paused alert")]
    Paused,
    /// The stored state already equals the requested one, usually because a
    /// concurrent evaluator got there first.
    #[error("update alert state requires a new state")]
    RequiresNewState,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationStateError {
    #[error("alert notification state version conflict")]
    VersionConflict,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub trait AlertStateStore: Send + Sync {
    /// Conditional state write. Rejects paused alerts and writes that would
    /// not change the stored state (unless forced).
    fn set_alert_state(
        &self,
        cmd: &SetAlertStateCommand,
    ) -> Result<AlertStateUpdate, SetAlertStateError>;
}

pub trait AnnotationStore: Send + Sync {
    fn save_annotation(&self, item: &Annotation) -> anyhow::Result<i64>;
}

pub trait NotificationStore: Send + Sync {
    /// Notifications referenced by `uids` plus every default notification of the org.
    fn notifications_to_send(
        &self,
        org_id: i64,
        uids: &[String],
    ) -> anyhow::Result<Vec<AlertNotification>>;

    fn get_or_create_notification_state(
        &self,
        org_id: i64,
        alert_id: i64,
        notifier_id: i64,
    ) -> anyhow::Result<AlertNotificationState>;

    /// Returns the new version. Fails with `VersionConflict` when another
    /// writer moved the record, unless this caller carries a newer rule
    /// state version.
    fn set_notification_state_pending(
        &self,
        cmd: &SetNotificationPendingCommand,
    ) -> Result<i64, NotificationStateError>;

    /// Always marks the record completed. A version other than the stored
    /// one is logged, not rejected.
    fn set_notification_state_complete(
        &self,
        id: i64,
        version: i64,
    ) -> Result<(), NotificationStateError>;
}
