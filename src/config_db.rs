use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;
use std::time::Duration;

use crate::alerting::store::{
    AlertStateStore, AnnotationStore, NotificationStateError, NotificationStore,
    SetAlertStateError,
};
use crate::models::alert::{
    AlertRecord, AlertRule, AlertStateUpdate, CreateAlertRequest, SetAlertStateCommand,
};
use crate::models::annotation::{Annotation, AnnotationQuery};
use crate::models::notification::{
    AlertNotification, AlertNotificationState, NotificationStateType,
    SetNotificationPendingCommand,
};

pub struct ConfigDb {
    conn: Mutex<Connection>,
}

const ALERT_COLUMNS: &str = "id, org_id, dashboard_id, dashboard_uid, dashboard_slug, panel_id, name, \
     message, state, paused, for_secs, no_data_state, execution_error_state, notifications, tags, \
     state_changes, new_state_date, execution_error, eval_data, created_at, updated_at";

const NOTIFICATION_COLUMNS: &str = "id, uid, org_id, name, type, is_default, send_reminder, \
     frequency_secs, disable_resolve_message, settings";

const STATE_COLUMNS: &str =
    "id, org_id, alert_id, notifier_id, state, version, updated_at, alert_rule_state_updated_version";

impl ConfigDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS alerts (
                id                    INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id                INTEGER NOT NULL,
                dashboard_id          INTEGER NOT NULL DEFAULT 0,
                dashboard_uid         TEXT NOT NULL DEFAULT '',
                dashboard_slug        TEXT NOT NULL DEFAULT '',
                panel_id              INTEGER NOT NULL DEFAULT 0,
                name                  TEXT NOT NULL,
                message               TEXT NOT NULL DEFAULT '',
                state                 TEXT NOT NULL DEFAULT 'pending'
                                      CHECK(state IN ('pending','alerting','ok','no_data','exec_error')),
                paused                INTEGER NOT NULL DEFAULT 0,
                for_secs              INTEGER NOT NULL DEFAULT 0,
                no_data_state         TEXT NOT NULL DEFAULT 'no_data',
                execution_error_state TEXT NOT NULL DEFAULT 'alerting',
                notifications         TEXT NOT NULL DEFAULT '[]',
                tags                  TEXT NOT NULL DEFAULT '[]',
                state_changes         INTEGER NOT NULL DEFAULT 0,
                new_state_date        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                execution_error       TEXT NOT NULL DEFAULT '',
                eval_data             TEXT NOT NULL DEFAULT '{}',
                created_at            TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at            TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_org ON alerts(org_id);

            CREATE TABLE IF NOT EXISTS annotations (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id       INTEGER NOT NULL,
                dashboard_id INTEGER NOT NULL DEFAULT 0,
                panel_id     INTEGER NOT NULL DEFAULT 0,
                alert_id     INTEGER NOT NULL,
                text         TEXT NOT NULL DEFAULT '',
                new_state    TEXT NOT NULL,
                prev_state   TEXT NOT NULL,
                epoch        INTEGER NOT NULL,
                data         TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_annotations_alert ON annotations(alert_id, epoch DESC);

            CREATE TABLE IF NOT EXISTS alert_notifications (
                id                      INTEGER PRIMARY KEY AUTOINCREMENT,
                uid                     TEXT NOT NULL,
                org_id                  INTEGER NOT NULL,
                name                    TEXT NOT NULL,
                type                    TEXT NOT NULL,
                is_default              INTEGER NOT NULL DEFAULT 0,
                send_reminder           INTEGER NOT NULL DEFAULT 0,
                frequency_secs          INTEGER NOT NULL DEFAULT 0,
                disable_resolve_message INTEGER NOT NULL DEFAULT 0,
                settings                TEXT NOT NULL DEFAULT '{}',
                created_at              TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at              TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                UNIQUE(org_id, uid)
            );

            CREATE TABLE IF NOT EXISTS alert_notification_state (
                id                               INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id                           INTEGER NOT NULL,
                alert_id                         INTEGER NOT NULL,
                notifier_id                      INTEGER NOT NULL,
                state                            TEXT NOT NULL DEFAULT 'unknown',
                version                          INTEGER NOT NULL DEFAULT 0,
                updated_at                       INTEGER NOT NULL DEFAULT 0,
                alert_rule_state_updated_version INTEGER NOT NULL DEFAULT 0,
                UNIQUE(org_id, alert_id, notifier_id)
            );
            ",
        )?;
        Ok(())
    }

    // ── Alert operations ──

    pub fn create_alert(&self, req: &CreateAlertRequest) -> anyhow::Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO alerts (org_id, dashboard_id, dashboard_uid, dashboard_slug, panel_id, name, \
             message, for_secs, no_data_state, execution_error_state, notifications, tags) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                req.org_id,
                req.dashboard_id,
                req.dashboard_uid,
                req.dashboard_slug,
                req.panel_id,
                req.name,
                req.message,
                req.for_secs,
                req.no_data_state.as_str(),
                req.execution_error_state.as_str(),
                serde_json::to_string(&req.notifications)?,
                serde_json::to_string(&req.tags)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_alerts(&self) -> anyhow::Result<Vec<AlertRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {ALERT_COLUMNS} FROM alerts ORDER BY id"))?;
        let rows = stmt
            .query_map([], alert_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_alert(&self, id: i64) -> anyhow::Result<Option<AlertRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
                params![id],
                alert_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_rule(&self, id: i64) -> anyhow::Result<Option<AlertRule>> {
        Ok(self.get_alert(id)?.map(|r| r.rule))
    }

    pub fn delete_alert(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM alert_notification_state WHERE alert_id = ?1", params![id])?;
        let count = conn.execute("DELETE FROM alerts WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }

    /// Pausing is a flag next to the state so unpausing resumes from it.
    pub fn set_alert_paused(&self, id: i64, paused: bool) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "UPDATE alerts SET paused = ?2, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?1",
            params![id, paused],
        )?;
        Ok(count > 0)
    }

    // ── Notification operations ──

    pub fn list_notifications(&self, org_id: i64) -> anyhow::Result<Vec<AlertNotification>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM alert_notifications WHERE org_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt
            .query_map(params![org_id], notification_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_notification(&self, id: i64) -> anyhow::Result<Option<AlertNotification>> {
        let conn = self.conn.lock();
        let n = conn
            .query_row(
                &format!("SELECT {NOTIFICATION_COLUMNS} FROM alert_notifications WHERE id = ?1"),
                params![id],
                notification_from_row,
            )
            .optional()?;
        Ok(n)
    }

    pub fn get_notification_by_uid(
        &self,
        org_id: i64,
        uid: &str,
    ) -> anyhow::Result<Option<AlertNotification>> {
        let conn = self.conn.lock();
        let n = conn
            .query_row(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM alert_notifications WHERE org_id = ?1 AND uid = ?2"
                ),
                params![org_id, uid],
                notification_from_row,
            )
            .optional()?;
        Ok(n)
    }

    pub fn create_notification(&self, n: &AlertNotification) -> anyhow::Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO alert_notifications (uid, org_id, name, type, is_default, send_reminder, \
             frequency_secs, disable_resolve_message, settings) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                n.uid,
                n.org_id,
                n.name,
                n.notifier_type,
                n.is_default,
                n.send_reminder,
                n.frequency.as_secs() as i64,
                n.disable_resolve_message,
                n.settings.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_notification(&self, id: i64, n: &AlertNotification) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "UPDATE alert_notifications SET uid = ?2, name = ?3, type = ?4, is_default = ?5, \
             send_reminder = ?6, frequency_secs = ?7, disable_resolve_message = ?8, settings = ?9, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?1",
            params![
                id,
                n.uid,
                n.name,
                n.notifier_type,
                n.is_default,
                n.send_reminder,
                n.frequency.as_secs() as i64,
                n.disable_resolve_message,
                n.settings.to_string(),
            ],
        )?;
        Ok(count > 0)
    }

    pub fn delete_notification(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM alert_notification_state WHERE notifier_id = ?1",
            params![id],
        )?;
        let count = conn.execute("DELETE FROM alert_notifications WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }

    /// Insert or replace the notification identified by `(org_id, uid)`.
    pub fn upsert_notification_by_uid(&self, n: &AlertNotification) -> anyhow::Result<i64> {
        match self.get_notification_by_uid(n.org_id, &n.uid)? {
            Some(existing) => {
                self.update_notification(existing.id, n)?;
                Ok(existing.id)
            }
            None => self.create_notification(n),
        }
    }

    pub fn delete_notification_by_uid(&self, org_id: i64, uid: &str) -> anyhow::Result<bool> {
        match self.get_notification_by_uid(org_id, uid)? {
            Some(existing) => self.delete_notification(existing.id),
            None => Ok(false),
        }
    }

    // ── Annotation operations ──

    pub fn list_annotations(&self, query: &AnnotationQuery) -> anyhow::Result<Vec<Annotation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, org_id, dashboard_id, panel_id, alert_id, text, new_state, prev_state, epoch, data \
             FROM annotations WHERE (?1 IS NULL OR alert_id = ?1) ORDER BY epoch DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![query.alert_id, query.limit], |row| {
                Ok(Annotation {
                    id: row.get(0)?,
                    org_id: row.get(1)?,
                    dashboard_id: row.get(2)?,
                    panel_id: row.get(3)?,
                    alert_id: row.get(4)?,
                    text: row.get(5)?,
                    new_state: row.get(6)?,
                    prev_state: row.get(7)?,
                    epoch: row.get(8)?,
                    data: json_column(row, 9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl From<rusqlite::Error> for SetAlertStateError {
    fn from(e: rusqlite::Error) -> Self {
        SetAlertStateError::Storage(e.into())
    }
}

impl From<rusqlite::Error> for NotificationStateError {
    fn from(e: rusqlite::Error) -> Self {
        NotificationStateError::Storage(e.into())
    }
}

impl AlertStateStore for ConfigDb {
    fn set_alert_state(
        &self,
        cmd: &SetAlertStateCommand,
    ) -> Result<AlertStateUpdate, SetAlertStateError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let current: Option<(String, bool, i64)> = tx
            .query_row(
                "SELECT state, paused, state_changes FROM alerts WHERE id = ?1 AND org_id = ?2",
                params![cmd.alert_id, cmd.org_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((state, paused, state_changes)) = current else {
            return Err(anyhow::anyhow!("alert {} not found", cmd.alert_id).into());
        };

        if paused {
            return Err(SetAlertStateError::Paused);
        }
        if state == cmd.state.as_str() && !cmd.force {
            return Err(SetAlertStateError::RequiresNewState);
        }

        let now = Utc::now();
        let state_changes = state_changes + 1;
        tx.execute(
            "UPDATE alerts SET state = ?2, state_changes = ?3, new_state_date = ?4, \
             execution_error = ?5, eval_data = ?6, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') \
             WHERE id = ?1",
            params![
                cmd.alert_id,
                cmd.state.as_str(),
                state_changes,
                now.to_rfc3339(),
                cmd.error,
                cmd.eval_data.to_string(),
            ],
        )?;
        tx.commit()?;

        Ok(AlertStateUpdate {
            state_changes,
            new_state_date: now,
        })
    }
}

impl AnnotationStore for ConfigDb {
    fn save_annotation(&self, item: &Annotation) -> anyhow::Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO annotations (org_id, dashboard_id, panel_id, alert_id, text, new_state, \
             prev_state, epoch, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                item.org_id,
                item.dashboard_id,
                item.panel_id,
                item.alert_id,
                item.text,
                item.new_state,
                item.prev_state,
                item.epoch,
                item.data.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

impl NotificationStore for ConfigDb {
    fn notifications_to_send(
        &self,
        org_id: i64,
        uids: &[String],
    ) -> anyhow::Result<Vec<AlertNotification>> {
        Ok(self
            .list_notifications(org_id)?
            .into_iter()
            .filter(|n| n.is_default || uids.contains(&n.uid))
            .collect())
    }

    fn get_or_create_notification_state(
        &self,
        org_id: i64,
        alert_id: i64,
        notifier_id: i64,
    ) -> anyhow::Result<AlertNotificationState> {
        let conn = self.conn.lock();
        // Another instance may insert between our read and write, the unique key settles it.
        conn.execute(
            "INSERT OR IGNORE INTO alert_notification_state (org_id, alert_id, notifier_id) \
             VALUES (?1, ?2, ?3)",
            params![org_id, alert_id, notifier_id],
        )?;
        let state = conn.query_row(
            &format!(
                "SELECT {STATE_COLUMNS} FROM alert_notification_state \
                 WHERE org_id = ?1 AND alert_id = ?2 AND notifier_id = ?3"
            ),
            params![org_id, alert_id, notifier_id],
            notification_state_from_row,
        )?;
        Ok(state)
    }

    fn set_notification_state_pending(
        &self,
        cmd: &SetNotificationPendingCommand,
    ) -> Result<i64, NotificationStateError> {
        let conn = self.conn.lock();
        let new_version = cmd.version + 1;
        let count = conn.execute(
            "UPDATE alert_notification_state SET state = ?1, version = ?2, updated_at = ?3, \
             alert_rule_state_updated_version = ?4 \
             WHERE id = ?5 AND (version = ?6 OR alert_rule_state_updated_version < ?4)",
            params![
                NotificationStateType::Pending.as_str(),
                new_version,
                Utc::now().timestamp(),
                cmd.alert_rule_state_updated_version,
                cmd.id,
                cmd.version,
            ],
        )?;
        if count == 0 {
            return Err(NotificationStateError::VersionConflict);
        }
        Ok(new_version)
    }

    fn set_notification_state_complete(
        &self,
        id: i64,
        version: i64,
    ) -> Result<(), NotificationStateError> {
        let conn = self.conn.lock();
        let current: Option<i64> = conn
            .query_row(
                "SELECT version FROM alert_notification_state WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            tracing::warn!(id, "alert notification state not found, nothing to complete");
            return Ok(());
        };
        if current != version {
            tracing::warn!(
                id,
                version,
                current_version = current,
                "a newer version of the alert notification state was found"
            );
        }

        // Completion always lands; the version never moves backwards.
        conn.execute(
            "UPDATE alert_notification_state SET state = ?1, version = ?2, updated_at = ?3 \
             WHERE id = ?4",
            params![
                NotificationStateType::Completed.as_str(),
                current.max(version) + 1,
                Utc::now().timestamp(),
                id,
            ],
        )?;
        Ok(())
    }
}

fn conversion_error(idx: usize, e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
}

fn parsed_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: anyhow::Error| conversion_error(idx, e))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn alert_from_row(row: &Row) -> rusqlite::Result<AlertRecord> {
    let new_state_date: String = row.get(16)?;
    let last_state_change = DateTime::parse_from_rfc3339(&new_state_date)
        .map_err(|e| conversion_error(16, e))?
        .with_timezone(&Utc);
    Ok(AlertRecord {
        rule: AlertRule {
            id: row.get(0)?,
            org_id: row.get(1)?,
            dashboard_id: row.get(2)?,
            dashboard_uid: row.get(3)?,
            dashboard_slug: row.get(4)?,
            panel_id: row.get(5)?,
            name: row.get(6)?,
            message: row.get(7)?,
            state: parsed_column(row, 8)?,
            paused: row.get(9)?,
            for_secs: row.get(10)?,
            no_data_state: parsed_column(row, 11)?,
            execution_error_state: parsed_column(row, 12)?,
            notifications: json_column(row, 13)?,
            alert_rule_tags: json_column(row, 14)?,
            state_changes: row.get(15)?,
            last_state_change,
        },
        execution_error: row.get(17)?,
        eval_data: json_column(row, 18)?,
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

fn notification_from_row(row: &Row) -> rusqlite::Result<AlertNotification> {
    let frequency_secs: i64 = row.get(7)?;
    Ok(AlertNotification {
        id: row.get(0)?,
        uid: row.get(1)?,
        org_id: row.get(2)?,
        name: row.get(3)?,
        notifier_type: row.get(4)?,
        is_default: row.get(5)?,
        send_reminder: row.get(6)?,
        frequency: Duration::from_secs(frequency_secs.max(0) as u64),
        disable_resolve_message: row.get(8)?,
        settings: json_column(row, 9)?,
    })
}

fn notification_state_from_row(row: &Row) -> rusqlite::Result<AlertNotificationState> {
    Ok(AlertNotificationState {
        id: row.get(0)?,
        org_id: row.get(1)?,
        alert_id: row.get(2)?,
        notifier_id: row.get(3)?,
        state: parsed_column(row, 4)?,
        version: row.get(5)?,
        updated_at: row.get(6)?,
        alert_rule_state_updated_version: row.get(7)?,
    })
}
