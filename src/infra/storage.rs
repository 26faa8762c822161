//! Filesystem-backed artifact storage with HMAC-style signed retrieval URLs.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{fs, io::AsyncWriteExt};
use url::Url;
use uuid::Uuid;

use crate::application::storage::{ArtifactRef, ObjectStore, StorageError};

const SIGNED_PREFIX: &str = "signed-";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("link expired")]
    Expired,
    #[error("signature mismatch")]
    Invalid,
}

#[derive(Debug)]
pub struct FilesystemObjectStore {
    root: PathBuf,
    public_base: Url,
    prefixes: u32,
    secret: String,
}

impl FilesystemObjectStore {
    /// Initialise storage rooted at `root`, creating it if necessary.
    pub fn new(
        root: PathBuf,
        mut public_base: Url,
        prefixes: u32,
        secret: impl Into<String>,
    ) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        if !public_base.path().ends_with('/') {
            let path = format!("{}/", public_base.path());
            public_base.set_path(&path);
        }
        Ok(Self {
            root,
            public_base,
            prefixes: prefixes.max(1),
            secret: secret.into(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Storage key for a filename: `{prefix}/{filename}`, where the prefix is
    /// derived from the filename's SHA-256 so keys spread evenly.
    pub fn key_for(&self, filename: &str) -> String {
        let digest = hex::encode(Sha256::digest(filename.as_bytes()));
        let bucket = u32::from_str_radix(&digest[..8], 16).unwrap_or(0) % self.prefixes;
        format!("{bucket}/{filename}")
    }

    pub fn signature(&self, key: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"|");
        hasher.update(key.as_bytes());
        hasher.update(b"|");
        hasher.update(expires.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Check a presented link. The comparison runs in constant time.
    pub fn verify(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
        now: OffsetDateTime,
    ) -> Result<(), SignatureError> {
        let expected = self.signature(key, expires);
        if expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() == 0 {
            return Err(SignatureError::Invalid);
        }
        if expires <= now.unix_timestamp() {
            return Err(SignatureError::Expired);
        }
        Ok(())
    }

    pub async fn read(&self, key: &str) -> Result<Bytes, StorageError> {
        let absolute = self.resolve(key)?;
        match fs::read(&absolute).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// Resolve the absolute filesystem path for a key.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative.is_absolute()
            || relative.components().any(|component| {
                matches!(
                    component,
                    Component::ParentDir | Component::Prefix(_) | Component::RootDir
                )
            })
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Write through a temporary sibling and rename, so readers never see a
    /// partial file and rewriting a key replaces it whole.
    async fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let absolute = self.resolve(key)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await?;
        }
        let staging = absolute.with_extension(format!("{}.part", Uuid::new_v4().simple()));
        let mut file = fs::File::create(&staging).await?;
        if let Err(err) = file.write_all(bytes).await {
            drop(file);
            let _ = fs::remove_file(&staging).await;
            return Err(err.into());
        }
        file.flush().await?;
        drop(file);
        fs::rename(&staging, &absolute).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn put(&self, filename: &str, bytes: Bytes) -> Result<ArtifactRef, StorageError> {
        if filename.is_empty() || filename.contains('/') {
            return Err(StorageError::InvalidKey(filename.to_string()));
        }
        let key = self.key_for(filename);
        self.write_atomic(&key, &bytes).await?;
        Ok(ArtifactRef::new(key))
    }

    async fn copy(&self, source: &ArtifactRef) -> Result<ArtifactRef, StorageError> {
        let (prefix, filename) = source
            .key()
            .split_once('/')
            .ok_or_else(|| StorageError::InvalidKey(source.key().to_string()))?;
        let target = if filename.starts_with(SIGNED_PREFIX) {
            source.key().to_string()
        } else {
            format!("{prefix}/{SIGNED_PREFIX}{filename}")
        };
        let bytes = self.read(source.key()).await?;
        self.write_atomic(&target, &bytes).await?;
        Ok(ArtifactRef::new(target))
    }

    async fn signed_url(
        &self,
        artifact: &ArtifactRef,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Result<String, StorageError> {
        self.resolve(artifact.key())?;
        let expires = (now + ttl).unix_timestamp();
        let signature = self.signature(artifact.key(), expires);
        let mut url = self
            .public_base
            .join(&format!("files/{}", artifact.key()))
            .map_err(|err| StorageError::Url(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);
        Ok(url.into())
    }
}
