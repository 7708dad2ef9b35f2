//! In-memory store, broker and provider used by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{
    HistoryRecord, InvalidTokenRecord, NewNotification, PendingNotification, PendingStatus,
};
use beacon_notifier::{DeliveryGateway, ProviderError, ProviderErrorCode, PushMessage, PushProvider};

use crate::broker::{FinishedState, JobBroker, QueueCounts, QueueName, RawClaim, RawJob};
use crate::context::{EngineContext, EngineSettings};
use crate::dispatcher::{Dispatcher, JobOutcome};
use crate::observer::JobObserver;
use crate::queue::{FailDisposition, Job, QueueManager, QueueSettings};
use crate::store::{HistoryFilter, HistoryStats, NotificationStore, TerminalRecord, sort_for_dispatch};

// ============================================================
// Store
// ============================================================

#[derive(Default)]
struct StoreState {
    pending: Vec<PendingNotification>,
    history: Vec<HistoryRecord>,
    invalid: BTreeMap<String, InvalidTokenRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    fail_inserts: Mutex<bool>,
}

impl MemoryStore {
    pub fn insert(&self, new: &NewNotification, status: PendingStatus) -> PendingNotification {
        let now = Utc::now();
        let row = PendingNotification {
            id: Uuid::new_v4(),
            device_token: new.device_token.clone(),
            title: new.title.clone(),
            body: new.body.clone(),
            additional_data: new
                .additional_data
                .clone()
                .unwrap_or_else(|| serde_json::json!({})),
            notification_type: new.notification_type,
            priority: new.priority,
            scheduled_at: new.scheduled_at.unwrap_or(now),
            status,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().unwrap().pending.push(row.clone());
        row
    }

    pub fn pending(&self, id: Uuid) -> Option<PendingNotification> {
        self.state
            .lock()
            .unwrap()
            .pending
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn all_pending(&self) -> Vec<PendingNotification> {
        self.state.lock().unwrap().pending.clone()
    }

    pub fn history(&self) -> Vec<HistoryRecord> {
        self.state.lock().unwrap().history.clone()
    }

    pub fn invalid_tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().invalid.keys().cloned().collect()
    }

    pub fn mark_invalid(&self, token: &str, marked_at: DateTime<Utc>) {
        self.state.lock().unwrap().invalid.insert(
            token.to_string(),
            InvalidTokenRecord {
                device_token: token.to_string(),
                reason: None,
                marked_at,
            },
        );
    }

    /// Backdate a row's `updated_at`.
    pub fn touch(&self, id: Uuid, updated_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.pending.iter_mut().find(|r| r.id == id) {
            row.updated_at = updated_at;
        }
    }

    pub fn push_history(&self, record: HistoryRecord) {
        self.state.lock().unwrap().history.push(record);
    }

    /// Make every insert fail as if the database were unreachable.
    pub fn fail_inserts(&self, fail: bool) {
        *self.fail_inserts.lock().unwrap() = fail;
    }

    fn check_inserts(&self) -> Result<(), AppError> {
        if *self.fail_inserts.lock().unwrap() {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert_pending(
        &self,
        new: &NewNotification,
        status: PendingStatus,
        _now: DateTime<Utc>,
    ) -> Result<PendingNotification, AppError> {
        self.check_inserts()?;
        Ok(self.insert(new, status))
    }

    async fn insert_pending_many(
        &self,
        items: &[(NewNotification, PendingStatus)],
        _now: DateTime<Utc>,
    ) -> Result<Vec<PendingNotification>, AppError> {
        self.check_inserts()?;
        Ok(items
            .iter()
            .map(|(new, status)| self.insert(new, *status))
            .collect())
    }

    async fn mark_processing(&self, ids: &[Uuid]) -> Result<Vec<PendingNotification>, AppError> {
        let mut state = self.state.lock().unwrap();
        let mut rows = Vec::new();
        for id in ids {
            if let Some(row) = state.pending.iter_mut().find(|r| r.id == *id) {
                row.status = PendingStatus::Processing;
                row.updated_at = Utc::now();
                rows.push(row.clone());
            }
        }
        Ok(rows)
    }

    async fn mark_failed(&self, ids: &[Uuid], error: &str) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        let mut changed = 0;
        for row in state.pending.iter_mut().filter(|r| ids.contains(&r.id)) {
            row.status = PendingStatus::Failed;
            row.last_error = Some(error.to_string());
            changed += 1;
        }
        Ok(changed)
    }

    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        last_error: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.pending.iter_mut().find(|r| r.id == id) {
            row.status = PendingStatus::Pending;
            row.attempts = row.attempts.max(attempts);
            row.last_error = Some(last_error.to_string());
            row.scheduled_at = scheduled_at;
        }
        Ok(())
    }

    async fn release(&self, ids: &[Uuid], scheduled_at: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        let mut changed = 0;
        for row in state.pending.iter_mut().filter(|r| ids.contains(&r.id)) {
            row.status = PendingStatus::Pending;
            row.scheduled_at = scheduled_at;
            changed += 1;
        }
        Ok(changed)
    }

    async fn finalize(&self, record: &TerminalRecord) -> Result<bool, AppError> {
        let mut state = self.state.lock().unwrap();
        let n = &record.notification;
        let Some(position) = state.pending.iter().position(|r| r.id == n.id) else {
            return Ok(false);
        };
        state.pending.remove(position);
        state.history.push(HistoryRecord {
            id: Uuid::new_v4(),
            original_id: Some(n.id),
            device_token: n.device_token.clone(),
            title: n.title.clone(),
            body: n.body.clone(),
            additional_data: n.additional_data.clone(),
            notification_type: n.notification_type,
            priority: n.priority,
            outcome: record.outcome,
            attempts: record.attempts,
            provider_response: record.provider_response.clone(),
            last_error: record.last_error.clone(),
            sent_at: Utc::now(),
        });
        if let Some(reason) = &record.invalid_token_reason {
            state
                .invalid
                .entry(n.device_token.clone())
                .or_insert_with(|| InvalidTokenRecord {
                    device_token: n.device_token.clone(),
                    reason: Some(reason.clone()),
                    marked_at: Utc::now(),
                });
        }
        Ok(true)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PendingNotification>, AppError> {
        let mut state = self.state.lock().unwrap();
        let mut due: Vec<PendingNotification> = state
            .pending
            .iter()
            .filter(|r| r.status == PendingStatus::Pending && r.scheduled_at <= now)
            .cloned()
            .collect();
        sort_for_dispatch(&mut due);
        due.truncate(limit.max(0) as usize);

        for claimed in due.iter_mut() {
            claimed.status = PendingStatus::Processing;
            if let Some(row) = state.pending.iter_mut().find(|r| r.id == claimed.id) {
                row.status = PendingStatus::Processing;
                row.updated_at = now;
            }
        }
        Ok(due)
    }

    async fn list_pending(&self) -> Result<Vec<PendingNotification>, AppError> {
        let mut rows: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .pending
            .iter()
            .filter(|r| r.status == PendingStatus::Pending)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.scheduled_at);
        Ok(rows)
    }

    async fn count_pending(&self) -> Result<i64, AppError> {
        Ok(self.list_pending().await?.len() as i64)
    }

    async fn list_history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRecord>, AppError> {
        let mut rows: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        rows.truncate(filter.effective_limit() as usize);
        Ok(rows)
    }

    async fn history_stats(&self, since: DateTime<Utc>) -> Result<HistoryStats, AppError> {
        use beacon_common::types::DeliveryOutcome;

        let state = self.state.lock().unwrap();
        let mut stats = HistoryStats::default();
        for record in state.history.iter().filter(|r| r.sent_at >= since) {
            stats.total += 1;
            match record.outcome {
                DeliveryOutcome::Sent => stats.sent += 1,
                DeliveryOutcome::Failed => stats.failed += 1,
                DeliveryOutcome::InvalidToken => stats.invalid_token += 1,
            }
        }
        Ok(stats)
    }

    async fn invalid_tokens_among(&self, tokens: &[String]) -> Result<Vec<String>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(tokens
            .iter()
            .filter(|t| state.invalid.contains_key(*t))
            .cloned()
            .collect())
    }

    async fn purge_history(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        let len = state.history.len();
        state.history.retain(|r| r.sent_at >= before);
        Ok((len - state.history.len()) as u64)
    }

    async fn purge_invalid_tokens(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        let len = state.invalid.len();
        state.invalid.retain(|_, r| r.marked_at >= before);
        Ok((len - state.invalid.len()) as u64)
    }

    async fn release_stale(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        let mut changed = 0;
        for row in state
            .pending
            .iter_mut()
            .filter(|r| r.status == PendingStatus::Processing && r.updated_at < before)
        {
            row.status = PendingStatus::Pending;
            changed += 1;
        }
        Ok(changed)
    }
}

// ============================================================
// Broker
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MemoryJob {
    pub id: u64,
    pub queue: QueueName,
    pub data: String,
    pub priority: u32,
    /// Delay requested at enqueue or by the last failure.
    pub delay: Duration,
    pub attempts_made: u32,
    pub state: JobState,
    pub failed_reason: Option<String>,
    finished_at: Option<Instant>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    jobs: Vec<MemoryJob>,
    paused: HashSet<QueueName>,
    leases: HashMap<String, String>,
}

/// Broker whose delayed jobs only become ready through `promote_delayed`.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn jobs(&self, queue: QueueName) -> Vec<MemoryJob> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|j| j.queue == queue)
            .cloned()
            .collect()
    }

    pub fn promote_delayed(&self, queue: QueueName) {
        let mut state = self.state.lock().unwrap();
        for job in state
            .jobs
            .iter_mut()
            .filter(|j| j.queue == queue && j.state == JobState::Delayed)
        {
            job.state = JobState::Waiting;
        }
    }

    pub fn counts_now(&self, queue: QueueName) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for job in self.jobs(queue) {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn try_lease_now(&self, key: &str, owner: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.leases.contains_key(key) {
            return false;
        }
        state.leases.insert(key.to_string(), owner.to_string());
        true
    }

    pub fn lease_holder(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().leases.get(key).cloned()
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn enqueue(
        &self,
        queue: QueueName,
        data: &str,
        priority: u32,
        delay: Duration,
    ) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.push(MemoryJob {
            id,
            queue,
            data: data.to_string(),
            priority,
            delay,
            attempts_made: 0,
            state: if delay.is_zero() {
                JobState::Waiting
            } else {
                JobState::Delayed
            },
            failed_reason: None,
            finished_at: None,
        });
        Ok(id)
    }

    async fn claim(&self, queue: QueueName, _lease: Duration) -> Result<RawClaim, AppError> {
        let mut state = self.state.lock().unwrap();
        if state.paused.contains(&queue) {
            return Ok(RawClaim::default());
        }

        let next = state
            .jobs
            .iter_mut()
            .filter(|j| j.queue == queue && j.state == JobState::Waiting)
            .min_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        Ok(RawClaim {
            job: next.map(|job| {
                job.state = JobState::Active;
                RawJob {
                    id: job.id,
                    data: job.data.clone(),
                    attempts_made: job.attempts_made,
                }
            }),
            requeued_stalled: 0,
        })
    }

    async fn complete(&self, queue: QueueName, job_id: u64) -> Result<bool, AppError> {
        let mut state = self.state.lock().unwrap();
        match state
            .jobs
            .iter_mut()
            .find(|j| j.queue == queue && j.id == job_id && j.state == JobState::Active)
        {
            Some(job) => {
                job.state = JobState::Completed;
                job.finished_at = Some(Instant::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fail(
        &self,
        queue: QueueName,
        job_id: u64,
        reason: &str,
        retry_after: Option<Duration>,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state
            .jobs
            .iter_mut()
            .find(|j| j.queue == queue && j.id == job_id && j.state == JobState::Active)
        {
            job.attempts_made += 1;
            job.failed_reason = Some(reason.to_string());
            match retry_after {
                Some(delay) => {
                    job.state = JobState::Delayed;
                    job.delay = delay;
                }
                None => {
                    job.state = JobState::Failed;
                    job.finished_at = Some(Instant::now());
                }
            }
        }
        Ok(())
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, AppError> {
        Ok(self.counts_now(queue))
    }

    async fn pause(&self, queue: QueueName) -> Result<(), AppError> {
        self.state.lock().unwrap().paused.insert(queue);
        Ok(())
    }

    async fn resume(&self, queue: QueueName) -> Result<(), AppError> {
        self.state.lock().unwrap().paused.remove(&queue);
        Ok(())
    }

    async fn clean(
        &self,
        queue: QueueName,
        state: FinishedState,
        older_than: Duration,
    ) -> Result<u64, AppError> {
        let target = match state {
            FinishedState::Completed => JobState::Completed,
            FinishedState::Failed => JobState::Failed,
        };
        let mut broker = self.state.lock().unwrap();
        let len = broker.jobs.len();
        broker.jobs.retain(|j| {
            !(j.queue == queue
                && j.state == target
                && j.finished_at.is_some_and(|at| at.elapsed() >= older_than))
        });
        Ok((len - broker.jobs.len()) as u64)
    }

    async fn try_lease(&self, key: &str, owner: &str, _ttl: Duration) -> Result<bool, AppError> {
        Ok(self.try_lease_now(key, owner))
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, AppError> {
        let mut state = self.state.lock().unwrap();
        if state.leases.get(key).is_some_and(|held| held == owner) {
            state.leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

// ============================================================
// Provider
// ============================================================

#[derive(Debug, Clone, Copy)]
pub enum ProviderScript {
    Fail(ProviderErrorCode),
    Panic,
}

/// Provider answering `msg-<n>` for every send unless scripted per token.
#[derive(Default)]
pub struct FakeProvider {
    scripts: Mutex<HashMap<String, ProviderScript>>,
    fail_batches: Mutex<bool>,
    sent: Mutex<u64>,
}

impl FakeProvider {
    pub fn script(&self, token: &str, script: ProviderScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert(token.to_string(), script);
    }

    pub fn clear(&self, token: &str) {
        self.scripts.lock().unwrap().remove(token);
    }

    pub fn fail_batches(&self, fail: bool) {
        *self.fail_batches.lock().unwrap() = fail;
    }

    pub fn sent_count(&self) -> u64 {
        *self.sent.lock().unwrap()
    }

    fn answer(&self, token: &str) -> Result<String, ProviderError> {
        let script = self.scripts.lock().unwrap().get(token).copied();
        let mut sent = self.sent.lock().unwrap();
        *sent += 1;
        match script {
            None => Ok(format!("msg-{}", *sent)),
            Some(ProviderScript::Fail(code)) => Err(ProviderError::new(code, "scripted failure")),
            Some(ProviderScript::Panic) => {
                drop(sent);
                panic!("scripted provider panic");
            }
        }
    }
}

#[async_trait]
impl PushProvider for FakeProvider {
    async fn send(&self, message: &PushMessage, _validate_only: bool) -> Result<String, ProviderError> {
        self.answer(&message.token)
    }

    async fn send_each(
        &self,
        messages: &[PushMessage],
    ) -> Result<Vec<Result<String, ProviderError>>, ProviderError> {
        if *self.fail_batches.lock().unwrap() {
            return Err(ProviderError::new(
                ProviderErrorCode::ServerUnavailable,
                "provider unavailable",
            ));
        }
        Ok(messages.iter().map(|m| self.answer(&m.token)).collect())
    }
}

// ============================================================
// Observer + harness
// ============================================================

#[derive(Default)]
pub struct RecordingObserver {
    completed: Mutex<Vec<(u64, JobOutcome)>>,
    failed: Mutex<Vec<(u64, FailDisposition)>>,
}

impl RecordingObserver {
    pub fn completed_count(&self) -> usize {
        self.completed.lock().unwrap().len()
    }

    pub fn failures(&self) -> Vec<(u64, FailDisposition)> {
        self.failed.lock().unwrap().clone()
    }
}

impl JobObserver for RecordingObserver {
    fn completed(&self, job: &Job, outcome: &JobOutcome, _elapsed: Duration) {
        self.completed
            .lock()
            .unwrap()
            .push((job.id, outcome.clone()));
    }

    fn failed(&self, job: &Job, _error: &str, disposition: FailDisposition) {
        self.failed.lock().unwrap().push((job.id, disposition));
    }

    fn stalled(&self, _queue: QueueName, _count: u64) {}
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub broker: Arc<MemoryBroker>,
    pub provider: Arc<FakeProvider>,
    pub observer: Arc<RecordingObserver>,
    pub queues: QueueManager,
    pub ctx: Arc<EngineContext>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::default());
        let broker = Arc::new(MemoryBroker::default());
        let provider = Arc::new(FakeProvider::default());
        let observer = Arc::new(RecordingObserver::default());

        let queues = QueueManager::new(broker.clone(), QueueSettings::default());
        let ctx = Arc::new(
            EngineContext::new(
                store.clone(),
                queues.clone(),
                DeliveryGateway::new(provider.clone()),
                EngineSettings::default(),
            )
            .with_observer(observer.clone()),
        );
        let dispatcher = Arc::new(Dispatcher::new(ctx.clone()));

        Self {
            store,
            broker,
            provider,
            observer,
            queues,
            ctx,
            dispatcher,
        }
    }
}
