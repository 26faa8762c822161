//! In-process implementations of every repository port and of the pipeline
//! queue. Used when no database is configured and by the test suites.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::application::pipeline::{
    Delivery, PipelineQueue, Reservation, ReservingQueue, Stage, StageMessage,
};
use crate::application::repos::{
    ApiKeysRepo, CreateApiKeyParams, HealthProbe, IdempotencyRecord, IdempotencyRepo,
    InsertOutcome, JobStatusRepo, QuotaRepo, RepoError, TransitionParams,
};
use crate::domain::api_keys::ApiKeyRecord;
use crate::domain::error::DomainError;
use crate::domain::jobs::JobRecord;
use crate::util::lock::mutex_lock;

const TARGET: &str = "papyrus::infra::memory";

#[derive(Debug, Clone, Copy)]
struct QuotaWindow {
    count: u32,
    expires_at: OffsetDateTime,
}

#[derive(Default)]
pub struct MemoryRepositories {
    jobs: DashMap<Uuid, JobRecord>,
    quotas: DashMap<(String, i64), QuotaWindow>,
    idempotency: DashMap<String, IdempotencyRecord>,
    api_keys: DashMap<Uuid, ApiKeyRecord>,
}

impl MemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

#[async_trait]
impl JobStatusRepo for MemoryRepositories {
    async fn create_job(&self, id: Uuid, at: OffsetDateTime) -> Result<JobRecord, RepoError> {
        match self.jobs.entry(id) {
            Entry::Occupied(_) => Err(RepoError::Duplicate {
                constraint: "pdf_jobs_pkey".to_string(),
            }),
            Entry::Vacant(slot) => Ok(slot.insert(JobRecord::queued(id, at)).clone()),
        }
    }

    async fn transition_job(&self, params: TransitionParams) -> Result<JobRecord, RepoError> {
        let mut record = self.jobs.get_mut(&params.id).ok_or(RepoError::NotFound)?;
        let current = record.stage;
        if let Some(expected) = params.expected
            && expected != current
        {
            return Err(RepoError::conflict(format!(
                "job {} is `{current}`, expected `{expected}`",
                params.id
            )));
        }
        DomainError::check_transition(current, params.to)?;
        record.apply(params.to, params.metadata, params.at);
        Ok(record.clone())
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<JobRecord>, RepoError> {
        Ok(self.jobs.get(&id).map(|record| record.clone()))
    }

    async fn purge_terminal_jobs(&self, before: OffsetDateTime) -> Result<u64, RepoError> {
        let mut purged = 0;
        self.jobs.retain(|_, record| {
            let expired = record.stage.is_terminal() && record.updated_at < before;
            purged += u64::from(expired);
            !expired
        });
        Ok(purged)
    }
}

#[async_trait]
impl QuotaRepo for MemoryRepositories {
    async fn increment_window(
        &self,
        key: &str,
        window_start: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Result<u32, RepoError> {
        let mut window = self
            .quotas
            .entry((key.to_string(), window_start.unix_timestamp()))
            .or_insert(QuotaWindow {
                count: 0,
                expires_at,
            });
        window.count = window.count.saturating_add(1);
        Ok(window.count)
    }

    async fn purge_windows(&self, now: OffsetDateTime) -> Result<u64, RepoError> {
        let mut purged = 0;
        self.quotas.retain(|_, window| {
            let expired = window.expires_at <= now;
            purged += u64::from(expired);
            !expired
        });
        Ok(purged)
    }
}

#[async_trait]
impl IdempotencyRepo for MemoryRepositories {
    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> Result<InsertOutcome, RepoError> {
        match self.idempotency.entry(record.key.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().expires_at <= record.created_at {
                    slot.insert(record);
                    Ok(InsertOutcome::Inserted)
                } else {
                    Ok(InsertOutcome::Existing(slot.get().clone()))
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn find_live(
        &self,
        key: &str,
        now: OffsetDateTime,
    ) -> Result<Option<IdempotencyRecord>, RepoError> {
        Ok(self
            .idempotency
            .get(key)
            .filter(|record| record.expires_at > now)
            .map(|record| record.clone()))
    }

    async fn release(&self, key: &str, job_id: Uuid) -> Result<(), RepoError> {
        self.idempotency
            .remove_if(key, |_, record| record.job_id == job_id);
        Ok(())
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, RepoError> {
        let mut purged = 0;
        self.idempotency.retain(|_, record| {
            let expired = record.expires_at <= now;
            purged += u64::from(expired);
            !expired
        });
        Ok(purged)
    }
}

#[async_trait]
impl ApiKeysRepo for MemoryRepositories {
    async fn create_key(&self, params: CreateApiKeyParams) -> Result<ApiKeyRecord, RepoError> {
        if self
            .api_keys
            .iter()
            .any(|entry| entry.key_hash == params.key_hash)
        {
            return Err(RepoError::Duplicate {
                constraint: "api_keys_key_hash_key".to_string(),
            });
        }
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            name: params.name,
            key_hash: params.key_hash,
            tier: params.tier,
            quota: params.quota,
            active: true,
            created_at: OffsetDateTime::now_utc(),
            last_used_at: None,
        };
        self.api_keys.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_active_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<ApiKeyRecord>, RepoError> {
        Ok(self
            .api_keys
            .iter()
            .find(|entry| entry.active && entry.key_hash == key_hash)
            .map(|entry| entry.value().clone()))
    }

    async fn list_keys(&self) -> Result<Vec<ApiKeyRecord>, RepoError> {
        let mut keys: Vec<_> = self
            .api_keys
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn deactivate_key(&self, id: Uuid) -> Result<bool, RepoError> {
        Ok(match self.api_keys.get_mut(&id) {
            Some(mut record) if record.active => {
                record.active = false;
                true
            }
            _ => false,
        })
    }

    async fn update_last_used(&self, id: Uuid, at: OffsetDateTime) -> Result<(), RepoError> {
        if let Some(mut record) = self.api_keys.get_mut(&id) {
            record.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for MemoryRepositories {
    async fn ping(&self) -> Result<(), RepoError> {
        Ok(())
    }
}

struct QueuedMessage {
    id: Uuid,
    message: StageMessage,
    attempts: u32,
    enqueued_at: OffsetDateTime,
    visible_at: Instant,
}

/// Per-stage FIFO queues with visibility timeouts, driven by the tokio
/// clock so tests can pause and advance time. Acknowledged messages are
/// dropped immediately.
pub struct MemoryQueue {
    stages: Mutex<HashMap<Stage, Vec<QueuedMessage>>>,
    enqueued: HashMap<Stage, AtomicU64>,
    signals: HashMap<Stage, Notify>,
    unavailable: AtomicBool,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self {
            stages: Mutex::new(HashMap::new()),
            enqueued: Stage::ALL.iter().map(|stage| (*stage, AtomicU64::new(0))).collect(),
            signals: Stage::ALL.iter().map(|stage| (*stage, Notify::new())).collect(),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages ever enqueued for `stage`, retries excluded.
    pub fn enqueued_count(&self, stage: Stage) -> u64 {
        self.enqueued
            .get(&stage)
            .map_or(0, |count| count.load(Ordering::SeqCst))
    }

    /// Make every call fail with a persistence error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RepoError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RepoError::Persistence("queue unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn push(&self, message: StageMessage, attempts: u32, visible_at: Instant) {
        let stage = message.stage;
        mutex_lock(&self.stages, TARGET, "queue_enqueue")
            .entry(stage)
            .or_default()
            .push(QueuedMessage {
                id: Uuid::new_v4(),
                message,
                attempts,
                enqueued_at: OffsetDateTime::now_utc(),
                visible_at,
            });
        if let Some(notify) = self.signals.get(&stage) {
            notify.notify_one();
        }
    }
}

#[async_trait]
impl PipelineQueue for MemoryQueue {
    async fn enqueue(&self, message: StageMessage) -> Result<(), RepoError> {
        self.check_available()?;
        if let Some(count) = self.enqueued.get(&message.stage) {
            count.fetch_add(1, Ordering::SeqCst);
        }
        self.push(message, 0, Instant::now());
        Ok(())
    }

    async fn enqueue_retry(
        &self,
        message: StageMessage,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), RepoError> {
        self.check_available()?;
        // `reserve` counts the delivery it hands out.
        self.push(message, attempt.saturating_sub(1), Instant::now() + delay);
        Ok(())
    }

    async fn depth(&self, stage: Stage) -> Result<u64, RepoError> {
        self.check_available()?;
        let stages = mutex_lock(&self.stages, TARGET, "queue_depth");
        Ok(stages.get(&stage).map_or(0, |messages| messages.len() as u64))
    }

    async fn purge_finished(&self, _before: OffsetDateTime) -> Result<u64, RepoError> {
        Ok(0)
    }
}

#[async_trait]
impl ReservingQueue for MemoryQueue {
    async fn reserve(
        &self,
        stage: Stage,
        visibility: Duration,
    ) -> Result<Option<Reservation>, RepoError> {
        self.check_available()?;
        let now = Instant::now();
        let mut stages = mutex_lock(&self.stages, TARGET, "queue_reserve");
        let Some(queued) = stages
            .get_mut(&stage)
            .and_then(|messages| messages.iter_mut().find(|entry| entry.visible_at <= now))
        else {
            return Ok(None);
        };
        queued.attempts += 1;
        queued.visible_at = now + visibility;
        Ok(Some(Reservation {
            id: queued.id,
            delivery: Delivery {
                message: queued.message.clone(),
                attempts: queued.attempts,
                enqueued_at: queued.enqueued_at,
            },
        }))
    }

    async fn ack(&self, reservation_id: Uuid) -> Result<(), RepoError> {
        self.check_available()?;
        let mut stages = mutex_lock(&self.stages, TARGET, "queue_ack");
        for messages in stages.values_mut() {
            messages.retain(|entry| entry.id != reservation_id);
        }
        Ok(())
    }

    async fn retry_later(&self, reservation_id: Uuid, delay: Duration) -> Result<(), RepoError> {
        self.check_available()?;
        let mut stages = mutex_lock(&self.stages, TARGET, "queue_retry");
        let entry = stages
            .values_mut()
            .flat_map(|messages| messages.iter_mut())
            .find(|entry| entry.id == reservation_id)
            .ok_or(RepoError::NotFound)?;
        entry.visible_at = Instant::now() + delay;
        Ok(())
    }

    async fn wait_for_work(&self, stage: Stage, max_wait: Duration) {
        match self.signals.get(&stage) {
            Some(notify) => {
                let _ = tokio::time::timeout(max_wait, notify.notified()).await;
            }
            None => tokio::time::sleep(max_wait).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::jobs::{JobStage, StageMetadata};

    #[tokio::test]
    async fn transition_rejects_stale_expectation() {
        let repos = MemoryRepositories::new();
        let id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        repos.create_job(id, now).await.expect("create");

        repos
            .transition_job(TransitionParams::new(id, JobStage::Generating, now).expecting(JobStage::Queued))
            .await
            .expect("queued -> generating");

        let stale = repos
            .transition_job(TransitionParams::new(id, JobStage::Generating, now).expecting(JobStage::Queued))
            .await;
        assert!(matches!(stale, Err(RepoError::Conflict { .. })));

        let skip = repos
            .transition_job(TransitionParams::new(id, JobStage::Signed, now))
            .await;
        assert!(matches!(skip, Err(RepoError::Conflict { .. })));
    }

    #[tokio::test]
    async fn terminal_jobs_are_frozen() {
        let repos = MemoryRepositories::new();
        let id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        repos.create_job(id, now).await.expect("create");
        repos
            .transition_job(
                TransitionParams::new(id, JobStage::Failed, now)
                    .with_metadata(StageMetadata::failure("boom")),
            )
            .await
            .expect("fail");

        let again = repos
            .transition_job(TransitionParams::new(id, JobStage::Failed, now))
            .await;
        assert!(matches!(again, Err(RepoError::Conflict { .. })));
        let record = repos.find_job(id).await.expect("find").expect("present");
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_job_transition_is_not_found() {
        let repos = MemoryRepositories::new();
        let result = repos
            .transition_job(TransitionParams::new(
                Uuid::new_v4(),
                JobStage::Generating,
                OffsetDateTime::now_utc(),
            ))
            .await;
        assert!(matches!(result, Err(RepoError::NotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn reserved_message_reappears_after_visibility() {
        let queue = MemoryQueue::new();
        let job_id = Uuid::new_v4();
        queue
            .enqueue(StageMessage::artifact(job_id, Stage::Sign, "1/a.pdf"))
            .await
            .expect("enqueue");

        let first = queue
            .reserve(Stage::Sign, Duration::from_secs(30))
            .await
            .expect("reserve")
            .expect("message");
        assert_eq!(first.delivery.attempts, 1);
        assert!(
            queue
                .reserve(Stage::Sign, Duration::from_secs(30))
                .await
                .expect("reserve")
                .is_none()
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue
            .reserve(Stage::Sign, Duration::from_secs(30))
            .await
            .expect("reserve")
            .expect("redelivery");
        assert_eq!(second.id, first.id);
        assert_eq!(second.delivery.attempts, 2);

        queue.ack(second.id).await.expect("ack");
        assert_eq!(queue.depth(Stage::Sign).await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn acknowledged_messages_are_not_retained() {
        let queue = MemoryQueue::new();
        for _ in 0..50 {
            queue
                .enqueue(StageMessage::artifact(Uuid::new_v4(), Stage::Deliver, "1/a.pdf"))
                .await
                .expect("enqueue");
            let reservation = queue
                .reserve(Stage::Deliver, Duration::from_secs(30))
                .await
                .expect("reserve")
                .expect("message");
            queue.ack(reservation.id).await.expect("ack");
        }

        assert_eq!(queue.enqueued_count(Stage::Deliver), 50);
        let stored: usize = mutex_lock(&queue.stages, TARGET, "test")
            .values()
            .map(Vec::len)
            .sum();
        assert_eq!(stored, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_retry_keeps_its_attempt_number() {
        let queue = MemoryQueue::new();
        queue
            .enqueue_retry(
                StageMessage::artifact(Uuid::new_v4(), Stage::Sign, "1/a.pdf"),
                3,
                Duration::from_secs(5),
            )
            .await
            .expect("schedule");
        assert_eq!(queue.enqueued_count(Stage::Sign), 0);
        assert!(
            queue
                .reserve(Stage::Sign, Duration::from_secs(30))
                .await
                .expect("reserve")
                .is_none()
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        let reservation = queue
            .reserve(Stage::Sign, Duration::from_secs(30))
            .await
            .expect("reserve")
            .expect("visible after delay");
        assert_eq!(reservation.delivery.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_later_hides_message_for_delay() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(StageMessage::artifact(Uuid::new_v4(), Stage::Deliver, "1/a.pdf"))
            .await
            .expect("enqueue");
        let delivery = queue
            .reserve(Stage::Deliver, Duration::from_secs(1))
            .await
            .expect("reserve")
            .expect("message");
        queue
            .retry_later(delivery.id, Duration::from_secs(10))
            .await
            .expect("retry");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(
            queue
                .reserve(Stage::Deliver, Duration::from_secs(1))
                .await
                .expect("reserve")
                .is_none()
        );
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(
            queue
                .reserve(Stage::Deliver, Duration::from_secs(1))
                .await
                .expect("reserve")
                .is_some()
        );
    }

    #[tokio::test]
    async fn stages_are_isolated() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(StageMessage::artifact(Uuid::new_v4(), Stage::Sign, "1/a.pdf"))
            .await
            .expect("enqueue");
        assert!(
            queue
                .reserve(Stage::Deliver, Duration::from_secs(1))
                .await
                .expect("reserve")
                .is_none()
        );
        assert_eq!(queue.enqueued_count(Stage::Sign), 1);
    }
}
