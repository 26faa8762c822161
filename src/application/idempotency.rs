//! Client idempotency tokens bound to the job they first produced.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::application::repos::{IdempotencyRecord, IdempotencyRepo, InsertOutcome, RepoError};

const MAX_TOKEN_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("invalid idempotency key: {0}")]
    InvalidToken(&'static str),
    #[error("idempotency store unavailable")]
    Unavailable(#[source] RepoError),
}

/// A client token scoped to the caller that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn parse(scope: &str, token: &str) -> Result<Self, IdempotencyError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(IdempotencyError::InvalidToken("token must not be empty"));
        }
        if token.len() > MAX_TOKEN_LEN {
            return Err(IdempotencyError::InvalidToken(
                "token must be at most 255 bytes",
            ));
        }
        if !token.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(IdempotencyError::InvalidToken(
                "token must be printable ASCII without spaces",
            ));
        }
        Ok(Self(format!("{scope}:{token}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Result of binding a token to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The token now points at the offered job id.
    Claimed,
    /// Another request won; the token points at this job instead.
    Existing(Uuid),
}

#[derive(Clone)]
pub struct IdempotencyCache {
    repo: Arc<dyn IdempotencyRepo>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(repo: Arc<dyn IdempotencyRepo>, ttl: Duration) -> Self {
        Self { repo, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn lookup(
        &self,
        key: &IdempotencyKey,
        now: OffsetDateTime,
    ) -> Result<Option<Uuid>, IdempotencyError> {
        let record = self
            .repo
            .find_live(key.as_str(), now)
            .await
            .map_err(IdempotencyError::Unavailable)?;
        Ok(record.map(|record| record.job_id))
    }

    /// Atomically bind `key` to `job_id` unless a live binding exists.
    pub async fn store(
        &self,
        key: &IdempotencyKey,
        job_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Claim, IdempotencyError> {
        let record = IdempotencyRecord {
            key: key.as_str().to_string(),
            job_id,
            created_at: now,
            expires_at: now + self.ttl,
        };
        match self
            .repo
            .insert_if_absent(record)
            .await
            .map_err(IdempotencyError::Unavailable)?
        {
            InsertOutcome::Inserted => Ok(Claim::Claimed),
            InsertOutcome::Existing(existing) => {
                debug!(
                    target = "papyrus::idempotency",
                    key = key.as_str(),
                    job_id = %existing.job_id,
                    "token already bound"
                );
                Ok(Claim::Existing(existing.job_id))
            }
        }
    }

    /// Undo a claim whose job could not be enqueued.
    pub async fn release(
        &self,
        key: &IdempotencyKey,
        job_id: Uuid,
    ) -> Result<(), IdempotencyError> {
        self.repo
            .release(key.as_str(), job_id)
            .await
            .map_err(IdempotencyError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::MemoryRepositories;

    fn cache(ttl: Duration) -> IdempotencyCache {
        IdempotencyCache::new(Arc::new(MemoryRepositories::default()), ttl)
    }

    #[test]
    fn tokens_are_scoped_and_validated() {
        let key = IdempotencyKey::parse("caller-a", " abc ").expect("valid");
        assert_eq!(key.as_str(), "caller-a:abc");
        assert_ne!(
            key,
            IdempotencyKey::parse("caller-b", "abc").expect("valid")
        );
        assert!(IdempotencyKey::parse("c", "").is_err());
        assert!(IdempotencyKey::parse("c", "has space").is_err());
        assert!(IdempotencyKey::parse("c", &"x".repeat(256)).is_err());
    }

    #[tokio::test]
    async fn concurrent_claims_converge_on_one_job() {
        let cache = cache(Duration::from_secs(60));
        let key = IdempotencyKey::parse("caller", "abc").expect("valid");
        let now = OffsetDateTime::now_utc();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let offered = Uuid::new_v4();
                let claim = cache.store(&key, offered, now).await.expect("store");
                match claim {
                    Claim::Claimed => offered,
                    Claim::Existing(winner) => winner,
                }
            }));
        }

        let mut observed = Vec::new();
        for handle in handles {
            observed.push(handle.await.expect("task"));
        }
        observed.dedup();
        assert_eq!(observed.len(), 1, "all requests see the same job id");
        assert_eq!(
            cache.lookup(&key, now).await.expect("lookup"),
            Some(observed[0])
        );
    }

    #[tokio::test]
    async fn expired_token_can_be_reused() {
        let cache = cache(Duration::from_secs(10));
        let key = IdempotencyKey::parse("caller", "abc").expect("valid");
        let now = OffsetDateTime::now_utc();
        let first = Uuid::new_v4();
        assert_eq!(
            cache.store(&key, first, now).await.expect("store"),
            Claim::Claimed
        );

        let later = now + Duration::from_secs(11);
        assert_eq!(cache.lookup(&key, later).await.expect("lookup"), None);

        let second = Uuid::new_v4();
        assert_eq!(
            cache.store(&key, second, later).await.expect("store"),
            Claim::Claimed
        );
        assert_eq!(
            cache.lookup(&key, later).await.expect("lookup"),
            Some(second)
        );
    }

    #[tokio::test]
    async fn release_only_removes_own_binding() {
        let cache = cache(Duration::from_secs(60));
        let key = IdempotencyKey::parse("caller", "abc").expect("valid");
        let now = OffsetDateTime::now_utc();
        let owner = Uuid::new_v4();
        cache.store(&key, owner, now).await.expect("store");

        cache.release(&key, Uuid::new_v4()).await.expect("release");
        assert_eq!(cache.lookup(&key, now).await.expect("lookup"), Some(owner));

        cache.release(&key, owner).await.expect("release");
        assert_eq!(cache.lookup(&key, now).await.expect("lookup"), None);
    }
}
