use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::application::repos::{ApiKeysRepo, CreateApiKeyParams, RepoError};
use crate::domain::api_keys::{ApiKeyRecord, ApiKeyTier, Identity, Quota};

const MIN_SECRET_LEN: usize = 32;
const MAX_NAME_LEN: usize = 120;

#[derive(Debug, Error)]
pub enum ApiKeyError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("key name must be 1 to 120 characters")]
    InvalidName,
    #[error("key not found")]
    NotFound,
}

#[derive(Debug, Error)]
pub enum ApiAuthError {
    #[error("invalid api key")]
    Invalid,
    #[error("credential store unavailable")]
    Unavailable(#[source] RepoError),
}

#[derive(Debug, Clone)]
pub struct IssueApiKeyCommand {
    pub name: String,
    pub tier: ApiKeyTier,
    /// Overrides the tier's default quota.
    pub quota: Option<Quota>,
}

#[derive(Debug, Clone)]
pub struct ApiKeyIssued {
    pub record: ApiKeyRecord,
    /// Plain secret; shown once and never stored.
    pub secret: String,
}

#[derive(Clone)]
pub struct ApiKeyService {
    repo: Arc<dyn ApiKeysRepo>,
}

impl ApiKeyService {
    pub fn new(repo: Arc<dyn ApiKeysRepo>) -> Self {
        Self { repo }
    }

    pub async fn issue(&self, cmd: IssueApiKeyCommand) -> Result<ApiKeyIssued, ApiKeyError> {
        let name = cmd.name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(ApiKeyError::InvalidName);
        }

        let secret = Self::generate_secret();
        let record = self
            .repo
            .create_key(CreateApiKeyParams {
                name: name.to_string(),
                key_hash: hash_secret(&secret),
                tier: cmd.tier,
                quota: cmd.quota.unwrap_or_else(|| cmd.tier.default_quota()),
            })
            .await?;

        Ok(ApiKeyIssued { record, secret })
    }

    pub async fn list(&self) -> Result<Vec<ApiKeyRecord>, ApiKeyError> {
        self.repo.list_keys().await.map_err(ApiKeyError::from)
    }

    pub async fn find(&self, id: Uuid) -> Result<ApiKeyRecord, ApiKeyError> {
        self.list()
            .await?
            .into_iter()
            .find(|record| record.id == id)
            .ok_or(ApiKeyError::NotFound)
    }

    pub async fn deactivate(&self, id: Uuid) -> Result<(), ApiKeyError> {
        if self.repo.deactivate_key(id).await? {
            Ok(())
        } else {
            Err(ApiKeyError::NotFound)
        }
    }

    pub async fn authenticate(&self, secret: &str) -> Result<Identity, ApiAuthError> {
        let secret = secret.trim();
        if secret.len() < MIN_SECRET_LEN {
            return Err(ApiAuthError::Invalid);
        }

        let record = self
            .repo
            .find_active_by_hash(&hash_secret(secret))
            .await
            .map_err(ApiAuthError::Unavailable)?
            .ok_or(ApiAuthError::Invalid)?;

        // best-effort last_used update; do not block auth
        let repo = self.repo.clone();
        let id = record.id;
        tokio::spawn(async move {
            if let Err(err) = repo.update_last_used(id, OffsetDateTime::now_utc()).await {
                debug!(target = "papyrus::api_keys", key_id = %id, error = %err, "last_used update failed");
            }
        });

        Ok(Identity::from(record))
    }

    fn generate_secret() -> String {
        format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
    }
}

/// Lower-case hex SHA-256 of a presented secret.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::MemoryRepositories;

    fn service() -> ApiKeyService {
        ApiKeyService::new(Arc::new(MemoryRepositories::default()))
    }

    #[tokio::test]
    async fn issued_secret_authenticates() {
        let service = service();
        let issued = service
            .issue(IssueApiKeyCommand {
                name: "clinic".into(),
                tier: ApiKeyTier::Premium,
                quota: None,
            })
            .await
            .expect("issue key");

        assert_eq!(issued.secret.len(), 64);
        assert_ne!(issued.record.key_hash, issued.secret);

        let identity = service
            .authenticate(&issued.secret)
            .await
            .expect("authenticate");
        assert_eq!(identity.key_id, issued.record.id);
        assert_eq!(identity.tier, ApiKeyTier::Premium);
        assert_eq!(identity.quota, ApiKeyTier::Premium.default_quota());
    }

    #[tokio::test]
    async fn deactivated_key_is_rejected() {
        let service = service();
        let issued = service
            .issue(IssueApiKeyCommand {
                name: "temp".into(),
                tier: ApiKeyTier::Basic,
                quota: Some(Quota::Unlimited),
            })
            .await
            .expect("issue key");

        service
            .deactivate(issued.record.id)
            .await
            .expect("deactivate");
        assert!(matches!(
            service.authenticate(&issued.secret).await,
            Err(ApiAuthError::Invalid)
        ));
        assert!(matches!(
            service.deactivate(Uuid::new_v4()).await,
            Err(ApiKeyError::NotFound)
        ));
    }

    #[tokio::test]
    async fn short_or_unknown_secrets_are_invalid() {
        let service = service();
        assert!(matches!(
            service.authenticate("short").await,
            Err(ApiAuthError::Invalid)
        ));
        assert!(matches!(
            service.authenticate(&"a".repeat(64)).await,
            Err(ApiAuthError::Invalid)
        ));
    }

    #[tokio::test]
    async fn find_returns_the_stored_record() {
        let service = service();
        let issued = service
            .issue(IssueApiKeyCommand {
                name: "lookup".into(),
                tier: ApiKeyTier::Basic,
                quota: None,
            })
            .await
            .expect("issue key");

        let found = service.find(issued.record.id).await.expect("find");
        assert_eq!(found, issued.record);
        assert!(matches!(
            service.find(Uuid::new_v4()).await,
            Err(ApiKeyError::NotFound)
        ));
    }

    #[tokio::test]
    async fn blank_name_is_refused() {
        let result = service()
            .issue(IssueApiKeyCommand {
                name: "   ".into(),
                tier: ApiKeyTier::Basic,
                quota: None,
            })
            .await;
        assert!(matches!(result, Err(ApiKeyError::InvalidName)));
    }
}
