//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::api_keys::{ApiKeyRecord, ApiKeyTier, Quota};
use crate::domain::error::DomainError;
use crate::domain::jobs::{JobRecord, JobStage, StageMetadata};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("conflicting update: {message}")]
    Conflict { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Timeout)
    }
}

impl From<DomainError> for RepoError {
    fn from(err: DomainError) -> Self {
        Self::conflict(err.to_string())
    }
}

/// One call to [`JobStatusRepo::transition_job`].
#[derive(Debug, Clone)]
pub struct TransitionParams {
    pub id: Uuid,
    /// When set, the stored stage must equal this value.
    pub expected: Option<JobStage>,
    pub to: JobStage,
    pub metadata: StageMetadata,
    pub at: OffsetDateTime,
}

impl TransitionParams {
    pub fn new(id: Uuid, to: JobStage, at: OffsetDateTime) -> Self {
        Self {
            id,
            expected: None,
            to,
            metadata: StageMetadata::default(),
            at,
        }
    }

    pub fn expecting(mut self, stage: JobStage) -> Self {
        self.expected = Some(stage);
        self
    }

    pub fn with_metadata(mut self, metadata: StageMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Durable per-job status. Implementations must apply a transition
/// atomically and reject it with [`RepoError::Conflict`] when the stored
/// stage cannot legally move to the target.
#[async_trait]
pub trait JobStatusRepo: Send + Sync {
    async fn create_job(&self, id: Uuid, at: OffsetDateTime) -> Result<JobRecord, RepoError>;

    async fn transition_job(&self, params: TransitionParams) -> Result<JobRecord, RepoError>;

    async fn find_job(&self, id: Uuid) -> Result<Option<JobRecord>, RepoError>;

    async fn purge_terminal_jobs(&self, before: OffsetDateTime) -> Result<u64, RepoError>;
}

/// Fixed-window request counters.
#[async_trait]
pub trait QuotaRepo: Send + Sync {
    /// Atomically add one hit to `key`'s window starting at `window_start`
    /// and return the new count.
    async fn increment_window(
        &self,
        key: &str,
        window_start: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Result<u32, RepoError>;

    async fn purge_windows(&self, now: OffsetDateTime) -> Result<u64, RepoError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub job_id: Uuid,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Existing(IdempotencyRecord),
}

#[async_trait]
pub trait IdempotencyRepo: Send + Sync {
    /// Set-if-absent. An expired record under the same key is replaced.
    async fn insert_if_absent(&self, record: IdempotencyRecord)
    -> Result<InsertOutcome, RepoError>;

    async fn find_live(
        &self,
        key: &str,
        now: OffsetDateTime,
    ) -> Result<Option<IdempotencyRecord>, RepoError>;

    /// Remove `key` only while it still points at `job_id`.
    async fn release(&self, key: &str, job_id: Uuid) -> Result<(), RepoError>;

    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, RepoError>;
}

#[derive(Debug, Clone)]
pub struct CreateApiKeyParams {
    pub name: String,
    pub key_hash: String,
    pub tier: ApiKeyTier,
    pub quota: Quota,
}

#[async_trait]
pub trait ApiKeysRepo: Send + Sync {
    async fn create_key(&self, params: CreateApiKeyParams) -> Result<ApiKeyRecord, RepoError>;

    async fn find_active_by_hash(&self, key_hash: &str)
    -> Result<Option<ApiKeyRecord>, RepoError>;

    async fn list_keys(&self) -> Result<Vec<ApiKeyRecord>, RepoError>;

    async fn deactivate_key(&self, id: Uuid) -> Result<bool, RepoError>;

    async fn update_last_used(&self, id: Uuid, at: OffsetDateTime) -> Result<(), RepoError>;
}

/// Connectivity check behind `/health/detailed`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn ping(&self) -> Result<(), RepoError>;
}
