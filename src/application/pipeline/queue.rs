use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::RepoError;

use super::{Stage, StageMessage};

/// One delivery of a queued message to its stage handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: StageMessage,
    /// Deliveries so far, this one included.
    pub attempts: u32,
    pub enqueued_at: OffsetDateTime,
}

/// A delivery held invisible by a [`ReservingQueue`] until acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: Uuid,
    pub delivery: Delivery,
}

/// Producer side of the per-stage queues.
#[async_trait]
pub trait PipelineQueue: Send + Sync {
    async fn enqueue(&self, message: StageMessage) -> Result<(), RepoError>;

    /// Enqueue a later delivery of `message` that counts as delivery
    /// `attempt` and becomes visible after `delay`.
    async fn enqueue_retry(
        &self,
        message: StageMessage,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), RepoError>;

    /// Messages waiting or in flight for `stage`.
    async fn depth(&self, stage: Stage) -> Result<u64, RepoError>;

    /// Drop bookkeeping of messages that finished before `before`.
    async fn purge_finished(&self, before: OffsetDateTime) -> Result<u64, RepoError>;
}

/// Queues polled directly by a [`RetryingConsumer`](super::RetryingConsumer).
///
/// A reserved message is invisible to other consumers until its visibility
/// timeout lapses; it is then redelivered with `attempts` incremented unless
/// it was acknowledged or rescheduled first.
#[async_trait]
pub trait ReservingQueue: PipelineQueue {
    async fn reserve(
        &self,
        stage: Stage,
        visibility: Duration,
    ) -> Result<Option<Reservation>, RepoError>;

    /// Remove a processed message.
    async fn ack(&self, reservation_id: Uuid) -> Result<(), RepoError>;

    /// Make a reserved message visible again after `delay`.
    async fn retry_later(&self, reservation_id: Uuid, delay: Duration) -> Result<(), RepoError>;

    /// Suspend until `stage` may have work, or at most `max_wait`.
    async fn wait_for_work(&self, stage: Stage, max_wait: Duration);
}
