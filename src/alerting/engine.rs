//! Ingests evaluation results and runs them through the result handler.
//!
//! Every rule has its own FIFO of pending results, drained by a single task,
//! so results for one rule are applied in submission order while different
//! rules run concurrently. `queue_capacity` bounds the results that are queued
//! or being handled across all rules.
//!
//! Rules are cached between passes and reloaded from storage whenever the last
//! pass left the cached copy in doubt.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::alerting::eval_context::{EvalContext, StateWrite};
use crate::alerting::result_handler::ResultHandler;
use crate::config_db::ConfigDb;
use crate::models::alert::{AlertRule, EvalResult};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("alert result queue is full")]
    QueueFull,
    #[error("alert engine is shut down")]
    Closed,
}

pub trait RuleSource: Send + Sync {
    fn load_rule(&self, id: i64) -> anyhow::Result<Option<AlertRule>>;
}

impl RuleSource for ConfigDb {
    fn load_rule(&self, id: i64) -> anyhow::Result<Option<AlertRule>> {
        self.get_rule(id)
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub app_url: String,
    pub evaluation_timeout: Duration,
    pub queue_capacity: usize,
}

/// A queued result. The permit is released once the result has been handled.
struct Queued {
    result: EvalResult,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct RuleSlot {
    pending: VecDeque<Queued>,
    /// A drain task owns this rule.
    draining: bool,
    cached: Option<AlertRule>,
    /// The rule changed while a pass was running.
    invalidated: bool,
}

/// Per-rule queues. A slot lives while it has queued work or a cached rule.
#[derive(Default)]
struct RuleSlots {
    slots: Mutex<HashMap<i64, RuleSlot>>,
}

impl RuleSlots {
    /// Queue a result. Returns true when the caller has to start a drain task.
    fn push(&self, rule_id: i64, item: Queued) -> bool {
        let mut slots = self.slots.lock();
        let slot = slots.entry(rule_id).or_default();
        slot.pending.push_back(item);
        !std::mem::replace(&mut slot.draining, true)
    }

    /// Next result for the rule together with the cached rule, if any. When
    /// the queue is empty the drain task gives up the slot, and a slot with
    /// nothing cached is dropped.
    fn next(&self, rule_id: i64) -> Option<(Queued, Option<AlertRule>)> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&rule_id)?;
        match slot.pending.pop_front() {
            Some(item) => {
                slot.invalidated = false;
                Some((item, slot.cached.take()))
            }
            None => {
                slot.draining = false;
                if slot.cached.is_none() {
                    slots.remove(&rule_id);
                }
                None
            }
        }
    }

    /// Store the rule to reuse for the next pass.
    fn finish(&self, rule_id: i64, rule: Option<AlertRule>) {
        if let Some(slot) = self.slots.lock().get_mut(&rule_id) {
            if !std::mem::take(&mut slot.invalidated) {
                slot.cached = rule;
            }
        }
    }

    fn invalidate(&self, rule_id: i64) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&rule_id) else {
            return;
        };
        slot.cached = None;
        if slot.draining {
            slot.invalidated = true;
        } else {
            slots.remove(&rule_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

#[derive(Clone)]
pub struct AlertEngine {
    worker: Arc<Worker>,
    permits: Arc<Semaphore>,
}

impl AlertEngine {
    /// Queue a result without waiting.
    pub fn submit(&self, result: EvalResult) -> Result<(), EngineError> {
        if self.worker.cancel.is_cancelled() {
            return Err(EngineError::Closed);
        }
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => EngineError::QueueFull,
                TryAcquireError::Closed => EngineError::Closed,
            })?;

        let rule_id = result.rule_id;
        let queued = Queued {
            result,
            _permit: permit,
        };
        if self.worker.slots.push(rule_id, queued) {
            let worker = self.worker.clone();
            tokio::spawn(async move { worker.drain(rule_id).await });
        }
        Ok(())
    }

    /// Drop the cached copy of a rule so the next pass reloads it. Also used
    /// when a rule is deleted.
    pub fn invalidate(&self, rule_id: i64) {
        self.worker.slots.invalidate(rule_id);
    }
}

struct Worker {
    rules: Arc<dyn RuleSource>,
    handler: Arc<ResultHandler>,
    settings: EngineSettings,
    slots: RuleSlots,
    cancel: CancellationToken,
}

pub fn spawn_alert_engine(
    rules: Arc<dyn RuleSource>,
    handler: Arc<ResultHandler>,
    settings: EngineSettings,
    cancel: CancellationToken,
) -> AlertEngine {
    let permits = Arc::new(Semaphore::new(settings.queue_capacity.max(1)));
    let worker = Arc::new(Worker {
        rules,
        handler,
        settings,
        slots: RuleSlots::default(),
        cancel: cancel.clone(),
    });

    tracing::info!("alert engine started");
    let closing = permits.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        closing.close();
        tracing::info!("alert engine stopped");
    });

    AlertEngine { worker, permits }
}

impl Worker {
    async fn drain(&self, rule_id: i64) {
        while let Some((queued, cached)) = self.slots.next(rule_id) {
            if self.cancel.is_cancelled() {
                continue;
            }
            let rule = self.process(rule_id, cached, queued.result).await;
            self.slots.finish(rule_id, rule);
        }
    }

    /// Handle one result. Returns the rule to cache for the next pass.
    async fn process(
        &self,
        rule_id: i64,
        cached: Option<AlertRule>,
        result: EvalResult,
    ) -> Option<AlertRule> {
        let rule = match cached {
            Some(rule) => rule,
            None => match self.rules.load_rule(rule_id) {
                Ok(Some(rule)) => rule,
                Ok(None) => {
                    tracing::warn!(rule_id, "result for unknown alert rule dropped");
                    return None;
                }
                Err(e) => {
                    tracing::error!(rule_id, "failed to load alert rule: {e}");
                    return None;
                }
            },
        };

        if rule.paused {
            tracing::debug!(rule_id, "skipping result for paused alert rule");
            return Some(rule);
        }

        let mut ctx = EvalContext::from_result(rule, result, self.settings.app_url.clone());
        match tokio::time::timeout(
            self.settings.evaluation_timeout,
            self.handler.handle(&mut ctx),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(rule_id, "alert result not applied: {e}"),
            Err(_) => {
                tracing::error!(rule_id, timeout = ?self.settings.evaluation_timeout, "alert result handling timed out");
                return None;
            }
        }

        // Anything other than a clean pass forces a reload.
        matches!(ctx.state_write, StateWrite::Committed | StateWrite::Skipped).then_some(ctx.rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::notification_service::NotificationDispatcher;
    use crate::models::alert::{
        AlertState, CreateAlertRequest, EvalMatch, ExecutionErrorOption, NoDataOption,
    };
    use crate::models::annotation::AnnotationQuery;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        db: Arc<ConfigDb>,
        loads: AtomicUsize,
    }

    impl RuleSource for CountingSource {
        fn load_rule(&self, id: i64) -> anyhow::Result<Option<AlertRule>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.db.get_rule(id)
        }
    }

    /// Records the first match value of every pass it sees.
    #[derive(Default)]
    struct RecordingDispatcher {
        calls: AtomicUsize,
        seen: parking_lot::Mutex<Vec<Option<f64>>>,
    }

    #[async_trait]
    impl NotificationDispatcher for RecordingDispatcher {
        async fn send_if_needed(&self, ctx: &mut EvalContext) {
            self.seen
                .lock()
                .push(ctx.eval_matches.first().and_then(|m| m.value));
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        db: Arc<ConfigDb>,
        source: Arc<CountingSource>,
        dispatcher: Arc<RecordingDispatcher>,
        engine: AlertEngine,
        cancel: CancellationToken,
        rule_id: i64,
    }

    fn fixture(queue_capacity: usize) -> Fixture {
        let db = Arc::new(ConfigDb::open(":memory:").unwrap());
        let rule_id = db
            .create_alert(&CreateAlertRequest {
                org_id: 1,
                dashboard_id: 0,
                dashboard_uid: String::new(),
                dashboard_slug: String::new(),
                panel_id: 0,
                name: "disk full".into(),
                message: String::new(),
                for_secs: 0,
                no_data_state: NoDataOption::NoData,
                execution_error_state: ExecutionErrorOption::Alerting,
                notifications: vec![],
                tags: vec![],
            })
            .unwrap();
        let source = Arc::new(CountingSource {
            db: db.clone(),
            loads: AtomicUsize::new(0),
        });
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let handler = Arc::new(ResultHandler::new(db.clone(), db.clone(), dispatcher.clone()));
        let cancel = CancellationToken::new();
        let engine = spawn_alert_engine(
            source.clone(),
            handler,
            EngineSettings {
                app_url: "http://localhost:3000/".into(),
                evaluation_timeout: Duration::from_secs(5),
                queue_capacity,
            },
            cancel.clone(),
        );
        Fixture {
            db,
            source,
            dispatcher,
            engine,
            cancel,
            rule_id,
        }
    }

    fn result(rule_id: i64, firing: bool) -> EvalResult {
        EvalResult {
            rule_id,
            firing,
            no_data_found: false,
            error: None,
            eval_matches: vec![],
            start_time: Utc::now(),
            force_state_update: false,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_result_is_persisted() {
        let f = fixture(16);
        f.engine.submit(result(f.rule_id, true)).unwrap();

        wait_until(|| f.dispatcher.calls.load(Ordering::SeqCst) == 1).await;
        let rule = f.db.get_rule(f.rule_id).unwrap().unwrap();
        assert_eq!(rule.state, AlertState::Alerting);
        assert_eq!(rule.state_changes, 1);

        let annotations = f
            .db
            .list_annotations(&AnnotationQuery {
                alert_id: Some(f.rule_id),
                limit: 10,
            })
            .unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].prev_state, "pending");
    }

    #[tokio::test]
    async fn test_rule_cached_between_passes() {
        let f = fixture(16);
        f.engine.submit(result(f.rule_id, true)).unwrap();
        wait_until(|| f.dispatcher.calls.load(Ordering::SeqCst) == 1).await;
        f.engine.submit(result(f.rule_id, true)).unwrap();
        wait_until(|| f.dispatcher.calls.load(Ordering::SeqCst) == 2).await;

        assert_eq!(f.source.loads.load(Ordering::SeqCst), 1);
        // The second pass saw the cached alerting state and did not write again.
        assert_eq!(f.db.get_rule(f.rule_id).unwrap().unwrap().state_changes, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_results_for_one_rule_applied_in_order() {
        const N: usize = 400;
        let f = fixture(1024);

        for seq in 0..N {
            let mut r = result(f.rule_id, seq % 2 == 0);
            r.eval_matches = vec![EvalMatch {
                metric: "seq".into(),
                tags: Default::default(),
                value: Some(seq as f64),
            }];
            f.engine.submit(r).unwrap();
        }

        wait_until(|| f.dispatcher.calls.load(Ordering::SeqCst) == N).await;
        let seen = f.dispatcher.seen.lock().clone();
        let expected: Vec<Option<f64>> = (0..N).map(|seq| Some(seq as f64)).collect();
        assert_eq!(seen, expected);

        // The last result (not firing) is what ends up stored.
        let rule = f.db.get_rule(f.rule_id).unwrap().unwrap();
        assert_eq!(rule.state, AlertState::Ok);
        assert_eq!(rule.state_changes, N as i64);
    }

    #[tokio::test]
    async fn test_invalidate_reloads_and_skips_paused() {
        let f = fixture(16);
        f.engine.submit(result(f.rule_id, true)).unwrap();
        wait_until(|| f.dispatcher.calls.load(Ordering::SeqCst) == 1).await;

        f.db.set_alert_paused(f.rule_id, true).unwrap();
        f.engine.invalidate(f.rule_id);
        f.engine.submit(result(f.rule_id, false)).unwrap();
        wait_until(|| f.source.loads.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(f.dispatcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.db.get_rule(f.rule_id).unwrap().unwrap().state,
            AlertState::Alerting
        );
    }

    #[tokio::test]
    async fn test_unknown_rule_leaves_no_slot() {
        let f = fixture(16);
        f.engine.submit(result(999, true)).unwrap();
        wait_until(|| f.source.loads.load(Ordering::SeqCst) == 1).await;
        wait_until(|| f.engine.worker.slots.len() == 0).await;
        assert_eq!(f.dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deleted_rule_releases_slot() {
        let f = fixture(16);
        f.engine.submit(result(f.rule_id, true)).unwrap();
        wait_until(|| f.dispatcher.calls.load(Ordering::SeqCst) == 1).await;
        wait_until(|| !f.engine.worker.slots.slots.lock()[&f.rule_id].draining).await;
        assert_eq!(f.engine.worker.slots.len(), 1);

        assert!(f.db.delete_alert(f.rule_id).unwrap());
        f.engine.invalidate(f.rule_id);
        assert_eq!(f.engine.worker.slots.len(), 0);

        // Late results for the deleted rule are dropped without leaking a slot.
        f.engine.submit(result(f.rule_id, false)).unwrap();
        wait_until(|| f.source.loads.load(Ordering::SeqCst) == 2).await;
        wait_until(|| f.engine.worker.slots.len() == 0).await;
        assert_eq!(f.dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_capacity_and_shutdown() {
        let f = fixture(1);
        // The drain task has not run yet on this single-threaded runtime.
        f.engine.submit(result(f.rule_id, true)).unwrap();
        assert!(matches!(
            f.engine.submit(result(f.rule_id, true)),
            Err(EngineError::QueueFull)
        ));

        wait_until(|| f.dispatcher.calls.load(Ordering::SeqCst) == 1).await;
        wait_until(|| f.engine.permits.available_permits() == 1).await;
        f.engine.submit(result(f.rule_id, false)).unwrap();
        wait_until(|| f.dispatcher.calls.load(Ordering::SeqCst) == 2).await;

        f.cancel.cancel();
        assert!(matches!(
            f.engine.submit(result(f.rule_id, true)),
            Err(EngineError::Closed)
        ));
    }
}
