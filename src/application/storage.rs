//! Object storage port for rendered artifacts.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("artifact `{0}` not found")]
    NotFound(String),
    #[error("invalid artifact key `{0}`")]
    InvalidKey(String),
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not build artifact url: {0}")]
    Url(String),
}

impl StorageError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::InvalidKey(_) | Self::Url(_))
    }
}

/// Opaque storage locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn key(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under a key derived from `filename`. Writing the same
    /// filename twice overwrites the same key.
    async fn put(&self, filename: &str, bytes: Bytes) -> Result<ArtifactRef, StorageError>;

    /// Duplicate an artifact to its signed location.
    async fn copy(&self, source: &ArtifactRef) -> Result<ArtifactRef, StorageError>;

    /// A retrieval URL valid for `ttl` from `now`.
    async fn signed_url(
        &self,
        artifact: &ArtifactRef,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Result<String, StorageError>;
}
