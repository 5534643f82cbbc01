//! TxQueue - 送信キューのエンジン
//!
//! # 責務
//! - 期限の来たタスクを 1 件ずつ順番に実行する（single flight）
//! - 成功したら削除、失敗したら指数バックオフで再スケジュール
//! - createBill 成功時に仮 ID を実 ID へ付け替える（キューとキャッシュの両方）
//! - 状態が変わるたびにキュー全体を永続化する
//!
//! タスク実行中はロックを握りません。タスクは複製して実行し、
//! 結果は task id で引き直して反映します。
//!
//! ロック順は cache → state。仮 ID の付け替えは両方を握ったまま行うので、
//! 編集側からは付け替え前か後のどちらかしか見えません。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::{QueuedTask, RetryPolicy, RunOutcome, TaskRunner};
use crate::cache::SharedBillCache;
use crate::domain::{BillId, BillTask, DraftToken, TaskId};
use crate::error::StoreError;
use crate::observability::QueueStats;
use crate::ports::{Clock, Connectivity, IdGenerator, TaskStore};

/// Engine timing knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sleep when nothing is due.
    pub idle_poll: Duration,
    /// Extra sleep after a failure while offline.
    pub offline_pause: Duration,
    pub retry: RetryPolicy,
    /// Start the loop on the first enqueue.
    pub autostart: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_millis(250),
            offline_pause: Duration::from_millis(1500),
            retry: RetryPolicy::default_v1(),
            autostart: true,
        }
    }
}

/// Result of one engine step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Nothing was due.
    Idle,
    Completed {
        task_id: TaskId,
        kind: &'static str,
    },
    Failed {
        task_id: TaskId,
        kind: &'static str,
        tries: u32,
        next_at: DateTime<Utc>,
    },
}

/// Queued tasks plus the drafts already created on the server.
#[derive(Default)]
struct QueueState {
    tasks: Vec<QueuedTask>,
    created: HashMap<DraftToken, u64>,
}

impl QueueState {
    fn resolve(&self, bill: BillId) -> BillId {
        match bill {
            BillId::Pending(token) => self
                .created
                .get(&token)
                .map_or(bill, |real| BillId::Real(*real)),
            real => real,
        }
    }
}

/// Durable, single-flight send queue for bill mutations.
pub struct TxQueue {
    state: Mutex<QueueState>,
    store: Arc<dyn TaskStore>,
    runner: TaskRunner,
    cache: SharedBillCache,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    connectivity: Arc<dyn Connectivity>,
    config: EngineConfig,
    running: AtomicBool,
    notify: Notify,
}

impl TxQueue {
    /// Build the engine around the tasks `store` already holds.
    pub fn new(
        store: Arc<dyn TaskStore>,
        runner: TaskRunner,
        cache: SharedBillCache,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        connectivity: Arc<dyn Connectivity>,
        config: EngineConfig,
    ) -> Self {
        let tasks = store.load();
        if !tasks.is_empty() {
            info!(count = tasks.len(), "restored queued tasks");
        }
        Self {
            state: Mutex::new(QueueState {
                tasks,
                created: HashMap::new(),
            }),
            store,
            runner,
            cache,
            clock,
            ids,
            connectivity,
            config,
            running: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Queue one task and persist.
    ///
    /// Nothing is queued if the store cannot be written. Queuing a delete
    /// drops any reconcile still waiting for that bill.
    pub async fn enqueue(self: &Arc<Self>, mut task: BillTask) -> Result<TaskId, StoreError> {
        let task_id = {
            let mut state = self.state.lock().await;
            task.resolve_with(|token| state.created.get(&token).copied());
            let tasks = &mut state.tasks;
            let before = tasks.clone();
            if let BillTask::DeleteBill { id } = task {
                tasks.retain(|t| !t.task.is_reconcile_of(id));
            }
            let task_id = self.push(tasks, task);
            if let Err(err) = self.store.save(tasks) {
                *tasks = before;
                return Err(err);
            }
            task_id
        };
        self.wake();
        Ok(task_id)
    }

    /// Queue `task` followed by a reconcile of its bill.
    ///
    /// A bill keeps at most one queued reconcile; it moves to the tail so it
    /// runs after every mutation queued so far.
    pub async fn enqueue_reconciled(
        self: &Arc<Self>,
        mut task: BillTask,
    ) -> Result<TaskId, StoreError> {
        let task_id = {
            let mut state = self.state.lock().await;
            task.resolve_with(|token| state.created.get(&token).copied());
            let bill = task.target();
            let tasks = &mut state.tasks;
            let before = tasks.clone();
            tasks.retain(|t| !t.task.is_reconcile_of(bill));
            let task_id = self.push(tasks, task);
            self.push(tasks, BillTask::Reconcile { id: bill });
            if let Err(err) = self.store.save(tasks) {
                *tasks = before;
                return Err(err);
            }
            task_id
        };
        self.wake();
        Ok(task_id)
    }

    /// Server id for `bill` if its draft has been created; `bill` otherwise.
    pub async fn resolve(&self, bill: BillId) -> BillId {
        self.state.lock().await.resolve(bill)
    }

    fn push(&self, tasks: &mut Vec<QueuedTask>, task: BillTask) -> TaskId {
        let task_id = self.ids.generate_task_id();
        debug!(%task_id, kind = task.kind(), bill_id = %task.target(), "enqueued");
        tasks.push(QueuedTask::new(task_id, task, self.clock.now()));
        task_id
    }

    fn wake(self: &Arc<Self>) {
        self.notify.notify_one();
        if self.config.autostart {
            self.start();
        }
    }

    /// Spawn the worker loop. Returns false if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run().await });
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn run(self: Arc<Self>) {
        info!("send queue started");
        loop {
            let outcome = self.step().await;
            if let Some(pause) = self.pause_after(&outcome) {
                if outcome == StepOutcome::Idle {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(pause) => {}
                    }
                } else {
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    /// How long the loop waits before the next step.
    fn pause_after(&self, outcome: &StepOutcome) -> Option<Duration> {
        match outcome {
            StepOutcome::Idle => Some(self.config.idle_poll),
            StepOutcome::Failed { .. } if !self.connectivity.is_online() => {
                Some(self.config.offline_pause)
            }
            StepOutcome::Failed { .. } | StepOutcome::Completed { .. } => None,
        }
    }

    /// Run the first due task, if any, and record the result.
    pub async fn step(&self) -> StepOutcome {
        let now = self.clock.now();
        let due = {
            let state = self.state.lock().await;
            state.tasks.iter().find(|t| t.is_due(now)).cloned()
        };
        let Some(record) = due else {
            return StepOutcome::Idle;
        };
        let kind = record.task.kind();

        match self.runner.run(&record.task).await {
            Ok(outcome) => {
                self.complete(&record, outcome).await;
                debug!(task_id = %record.id, kind, "task done");
                StepOutcome::Completed {
                    task_id: record.id,
                    kind,
                }
            }
            Err(err) => {
                let now = self.clock.now();
                let mut state = self.state.lock().await;
                let Some(queued) = state.tasks.iter_mut().find(|t| t.id == record.id) else {
                    // dropped while it ran
                    return StepOutcome::Completed {
                        task_id: record.id,
                        kind,
                    };
                };
                queued.tries = queued.tries.saturating_add(1);
                let delay = self.config.retry.next_delay(queued.tries);
                queued.schedule_retry(now, delay, err.to_string());
                let (tries, next_at) = (queued.tries, queued.next_at);
                warn!(
                    task_id = %record.id,
                    kind,
                    tries,
                    retry_in = ?delay,
                    error = %err,
                    "task failed; will retry"
                );
                self.persist(&state.tasks);
                StepOutcome::Failed {
                    task_id: record.id,
                    kind,
                    tries,
                    next_at,
                }
            }
        }
    }

    async fn complete(&self, record: &QueuedTask, outcome: RunOutcome) {
        let task_id = record.id;
        match outcome {
            RunOutcome::Created { temp_id, real_id } => {
                let mut cache = self.cache.lock().await;
                let mut state = self.state.lock().await;
                state.created.insert(temp_id, real_id);
                let rewritten: usize = state
                    .tasks
                    .iter_mut()
                    .map(|t| t.task.remap(temp_id, real_id))
                    .sum();
                state.tasks.retain(|t| t.id != task_id);
                self.persist(&state.tasks);
                cache.remap(temp_id, real_id);
                info!(%temp_id, real_id, rewritten, "bill created; pending references rewritten");
            }
            RunOutcome::Updated(bill) | RunOutcome::Reconciled(bill) => {
                let mut cache = self.cache.lock().await;
                let mut state = self.state.lock().await;
                state.tasks.retain(|t| t.id != task_id);
                self.persist(&state.tasks);
                let deleting = state
                    .tasks
                    .iter()
                    .any(|t| matches!(t.task, BillTask::DeleteBill { id } if id == bill.id));
                if deleting {
                    debug!(bill_id = %bill.id, "bill is being deleted; server copy not cached");
                } else {
                    cache.upsert(bill);
                }
            }
            RunOutcome::ReconcileSkipped | RunOutcome::Done => {
                if let BillTask::DeleteBill { id } = record.task {
                    self.cache.lock().await.remove(id);
                }
                self.remove(task_id).await;
            }
        }
    }

    async fn remove(&self, task_id: TaskId) {
        let mut state = self.state.lock().await;
        state.tasks.retain(|t| t.id != task_id);
        self.persist(&state.tasks);
    }

    fn persist(&self, tasks: &[QueuedTask]) {
        if let Err(err) = self.store.save(tasks) {
            warn!(error = %err, "failed to persist send queue");
        }
    }

    pub async fn snapshot(&self) -> Vec<QueuedTask> {
        self.state.lock().await.tasks.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.tasks.is_empty()
    }

    pub async fn stats(&self) -> QueueStats {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let tasks = &state.tasks;
        let due = tasks.iter().filter(|t| t.is_due(now)).count();
        QueueStats {
            total: tasks.len(),
            due,
            backing_off: tasks.len() - due,
            max_tries: tasks.iter().map(|t| t.tries).max().unwrap_or(0),
        }
    }

    pub fn cache(&self) -> &SharedBillCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BillCache;
    use crate::domain::{Bill, BillId, BillPatch, CastSelection, DraftToken, NewBill, StayType};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{ManualClock, OnlineFlag, UlidGenerator};
    use crate::testing::FakeBillApi;
    use chrono::TimeZone;
    use serde_json::{Map, json};

    struct Harness {
        queue: Arc<TxQueue>,
        api: Arc<FakeBillApi>,
        store: Arc<InMemoryTaskStore>,
        clock: ManualClock,
        online: OnlineFlag,
    }

    fn harness_with(api: FakeBillApi, store: InMemoryTaskStore) -> Harness {
        let api = Arc::new(api);
        let store = Arc::new(store);
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap());
        let online = OnlineFlag::new();
        let queue = Arc::new(TxQueue::new(
            store.clone(),
            TaskRunner::new(api.clone()),
            BillCache::shared(),
            Arc::new(clock.clone()),
            Arc::new(UlidGenerator::new(clock.clone())),
            Arc::new(online.clone()),
            EngineConfig {
                autostart: false,
                ..EngineConfig::default()
            },
        ));
        Harness {
            queue,
            api,
            store,
            clock,
            online,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeBillApi::new(), InMemoryTaskStore::new())
    }

    fn new_bill(table_id: u64) -> NewBill {
        NewBill {
            table_id: Some(table_id),
            opened_at: None,
            expected_out: None,
            memo: String::new(),
        }
    }

    fn memo(text: &str) -> BillPatch {
        let mut fields = Map::new();
        fields.insert("memo".into(), json!(text));
        BillPatch::fields(fields)
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let h = harness();

        assert!(h.queue.start());
        assert!(!h.queue.start());
        assert!(h.queue.is_running());
    }

    #[tokio::test]
    async fn create_success_rewrites_every_pending_reference() {
        let h = harness_with(FakeBillApi::with_next_id(42), InMemoryTaskStore::new());
        let token = DraftToken::from_ulid(ulid::Ulid::new());
        let pending = BillId::Pending(token);
        h.queue
            .cache()
            .lock()
            .await
            .upsert(Bill::draft(token, &new_bill(5)));

        h.queue
            .enqueue(BillTask::CreateBill {
                temp_id: token,
                bill: new_bill(5),
            })
            .await
            .unwrap();
        h.queue
            .enqueue(BillTask::PatchBill {
                id: pending,
                payload: BillPatch {
                    bill_id: Some(pending),
                    ..memo("window seat")
                },
            })
            .await
            .unwrap();
        h.queue
            .enqueue_reconciled(BillTask::UpdateBillCasts {
                bill_id: pending,
                casts: CastSelection::default(),
            })
            .await
            .unwrap();

        let outcome = h.queue.step().await;
        assert!(matches!(outcome, StepOutcome::Completed { kind: "createBill", .. }));

        let queued = h.queue.snapshot().await;
        assert_eq!(queued.len(), 3);
        assert!(queued.iter().all(|t| !t.task.references(pending)));
        assert!(queued.iter().all(|t| t.task.references(BillId::Real(42))));
        let persisted = h.store.tasks();
        assert!(persisted.iter().all(|t| !t.task.references(pending)));

        let cache = h.queue.cache().lock().await;
        assert!(cache.get(pending).is_none());
        assert_eq!(cache.get(BillId::Real(42)).unwrap().table_id(), Some(5));
    }

    #[tokio::test]
    async fn create_then_dependents_drain_against_the_real_id() {
        let h = harness_with(FakeBillApi::with_next_id(42), InMemoryTaskStore::new());
        let token = DraftToken::from_ulid(ulid::Ulid::new());
        h.queue
            .enqueue(BillTask::CreateBill {
                temp_id: token,
                bill: new_bill(5),
            })
            .await
            .unwrap();
        h.queue
            .enqueue_reconciled(BillTask::PatchBill {
                id: BillId::Pending(token),
                payload: memo("late"),
            })
            .await
            .unwrap();

        while h.queue.step().await != StepOutcome::Idle {}

        assert!(h.queue.is_empty().await);
        assert_eq!(
            h.api.calls(),
            vec!["create_bill", "patch_bill:42", "fetch_bill:42"]
        );
        let cache = h.queue.cache().lock().await;
        assert_eq!(cache.get(BillId::Real(42)).unwrap().memo, "late");
    }

    #[tokio::test]
    async fn task_queued_after_create_with_the_draft_id_uses_the_real_id() {
        let h = harness_with(FakeBillApi::with_next_id(42), InMemoryTaskStore::new());
        let token = DraftToken::from_ulid(ulid::Ulid::new());
        let pending = BillId::Pending(token);
        h.queue
            .enqueue(BillTask::CreateBill {
                temp_id: token,
                bill: new_bill(5),
            })
            .await
            .unwrap();
        h.queue.step().await;
        assert_eq!(h.queue.resolve(pending).await, BillId::Real(42));

        // an edit that read the cache before the swap
        h.queue
            .enqueue_reconciled(BillTask::UpdateBillTable {
                id: pending,
                table_id: Some(8),
            })
            .await
            .unwrap();

        let queued = h.queue.snapshot().await;
        assert!(queued.iter().all(|t| t.task.target() == BillId::Real(42)));
        while h.queue.step().await != StepOutcome::Idle {}
        assert!(h.queue.is_empty().await);
        assert_eq!(h.api.bill(42).unwrap().table_id(), Some(8));
    }

    #[tokio::test]
    async fn update_landing_before_a_queued_delete_is_not_cached() {
        let h = harness();
        h.api.insert(7);
        let id = BillId::Real(7);
        h.queue
            .enqueue(BillTask::UpdateBillCasts {
                bill_id: id,
                casts: CastSelection {
                    nom_ids: vec![3],
                    free_ids: vec![3],
                    ..CastSelection::default()
                },
            })
            .await
            .unwrap();
        h.queue.enqueue(BillTask::DeleteBill { id }).await.unwrap();

        assert!(matches!(
            h.queue.step().await,
            StepOutcome::Completed { kind: "updateBillCasts", .. }
        ));
        assert!(h.queue.cache().lock().await.get(id).is_none());

        h.queue.step().await;
        assert!(h.api.bill(7).is_none());
        assert!(h.queue.cache().lock().await.get(id).is_none());
    }

    #[tokio::test]
    async fn completed_delete_drops_the_cached_bill() {
        let h = harness();
        h.api.insert(7);
        h.queue.cache().lock().await.upsert(crate::testing::bill(7));

        h.queue
            .enqueue(BillTask::DeleteBill { id: BillId::Real(7) })
            .await
            .unwrap();
        h.queue.step().await;

        assert!(h.queue.cache().lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_cast_update_retries_then_lands_in_cache() {
        let h = harness();
        h.api.insert(7);
        h.api.fail_next("update_casts", 1);
        h.queue.cache().lock().await.upsert(crate::testing::bill(7));

        h.queue
            .enqueue(BillTask::UpdateBillCasts {
                bill_id: BillId::Real(7),
                casts: CastSelection {
                    nom_ids: vec![3],
                    free_ids: vec![3],
                    ..CastSelection::default()
                },
            })
            .await
            .unwrap();

        let StepOutcome::Failed { tries, next_at, .. } = h.queue.step().await else {
            panic!("first attempt should fail");
        };
        assert_eq!(tries, 1);
        assert_eq!(next_at, h.clock.now() + chrono::Duration::seconds(2));
        assert_eq!(h.queue.step().await, StepOutcome::Idle);
        assert_eq!(h.queue.stats().await.backing_off, 1);

        h.clock.advance(chrono::Duration::seconds(2));
        assert!(matches!(h.queue.step().await, StepOutcome::Completed { .. }));

        assert!(h.queue.is_empty().await);
        let cache = h.queue.cache().lock().await;
        let bill = cache.get(BillId::Real(7)).unwrap();
        let active: Vec<_> = bill
            .stays
            .iter()
            .filter(|s| s.is_active())
            .map(|s| (s.cast.id, s.stay_type))
            .collect();
        assert_eq!(active, vec![(3, StayType::Nom)]);
    }

    #[tokio::test]
    async fn retry_delay_grows_and_caps_at_a_minute() {
        let h = harness();
        h.api.insert(7);
        h.api.fail_next("close_bill", 20);
        h.queue
            .enqueue(BillTask::CloseBill {
                id: BillId::Real(7),
                settled_total: Some(12_000),
            })
            .await
            .unwrap();

        let mut delays = Vec::new();
        for _ in 0..10 {
            let now = h.clock.now();
            let StepOutcome::Failed { next_at, .. } = h.queue.step().await else {
                panic!("expected failure");
            };
            delays.push((next_at - now).num_milliseconds());
            h.clock.set(next_at);
        }

        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[0], 2_000);
        assert_eq!(*delays.last().unwrap(), 60_000);
        assert!(delays.iter().all(|d| *d <= 60_000));
    }

    #[tokio::test]
    async fn offline_failure_adds_a_pause() {
        let h = harness();
        let failed = StepOutcome::Failed {
            task_id: TaskId::from_ulid(ulid::Ulid::new()),
            kind: "closeBill",
            tries: 1,
            next_at: h.clock.now(),
        };

        assert_eq!(h.queue.pause_after(&failed), None);
        h.online.set(false);
        assert_eq!(
            h.queue.pause_after(&failed),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            h.queue.pause_after(&StepOutcome::Idle),
            Some(Duration::from_millis(250))
        );
    }

    #[tokio::test]
    async fn reconcile_is_kept_single_and_last() {
        let h = harness();
        let bill = BillId::Real(7);

        h.queue
            .enqueue_reconciled(BillTask::PatchBill {
                id: bill,
                payload: memo("a"),
            })
            .await
            .unwrap();
        h.queue
            .enqueue_reconciled(BillTask::UpdateBillTable {
                id: bill,
                table_id: Some(3),
            })
            .await
            .unwrap();

        let kinds: Vec<_> = h
            .queue
            .snapshot()
            .await
            .iter()
            .map(|t| t.task.kind())
            .collect();
        assert_eq!(kinds, vec!["patchBill", "updateBillTable", "reconcile"]);
    }

    #[tokio::test]
    async fn delete_drops_pending_reconcile() {
        let h = harness();
        let bill = BillId::Real(7);
        h.queue
            .enqueue_reconciled(BillTask::PatchBill {
                id: bill,
                payload: memo("a"),
            })
            .await
            .unwrap();

        h.queue.enqueue(BillTask::DeleteBill { id: bill }).await.unwrap();

        let kinds: Vec<_> = h
            .queue
            .snapshot()
            .await
            .iter()
            .map(|t| t.task.kind())
            .collect();
        assert_eq!(kinds, vec!["patchBill", "deleteBill"]);
    }

    #[tokio::test]
    async fn enqueue_rolls_back_when_the_store_fails() {
        let h = harness();
        h.store.fail_saves(true);

        let result = h
            .queue
            .enqueue(BillTask::Reconcile {
                id: BillId::Real(1),
            })
            .await;

        assert!(result.is_err());
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn queue_survives_a_restart() {
        let store = InMemoryTaskStore::new();
        let first = harness_with(FakeBillApi::new(), store.clone());
        first
            .queue
            .enqueue(BillTask::Reconcile {
                id: BillId::Real(9),
            })
            .await
            .unwrap();

        let second = harness_with(FakeBillApi::new(), store);

        let restored = second.queue.snapshot().await;
        assert_eq!(restored.len(), 1);
        assert!(restored[0].task.is_reconcile_of(BillId::Real(9)));
    }

    #[tokio::test]
    async fn loop_drains_once_started() {
        let api = FakeBillApi::new();
        api.insert(3);
        let h = harness_with(api, InMemoryTaskStore::new());
        h.queue
            .enqueue(BillTask::CloseBill {
                id: BillId::Real(3),
                settled_total: None,
            })
            .await
            .unwrap();

        h.queue.start();
        for _ in 0..100 {
            if h.queue.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(h.queue.is_empty().await);
        assert!(h.api.bill(3).unwrap().closed_at.is_some());
    }
}
