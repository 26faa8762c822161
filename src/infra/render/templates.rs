//! Read-through cache of typesetter templates on disk.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use lru::LruCache;
use tokio::fs;
use tracing::debug;

use crate::application::render::RenderError;
use crate::domain::documents::DocumentType;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "infra::render::templates";
const TEMPLATE_EXTENSION: &str = "typ";

/// A template file present on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateFile {
    pub document_type: DocumentType,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

#[derive(Clone)]
struct CachedTemplate {
    modified: SystemTime,
    source: Arc<str>,
}

/// Template sources keyed by path. An entry is reused only while the file's
/// modification time is unchanged.
pub struct TemplateCache {
    root: PathBuf,
    entries: Mutex<LruCache<PathBuf, CachedTemplate>>,
}

impl TemplateCache {
    pub fn new(root: impl Into<PathBuf>, capacity: NonZeroUsize) -> Self {
        Self {
            root: root.into(),
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, document_type: DocumentType) -> PathBuf {
        self.root
            .join(format!("{}.{TEMPLATE_EXTENSION}", document_type.as_str()))
    }

    pub async fn load(&self, document_type: DocumentType) -> Result<Arc<str>, RenderError> {
        let path = self.path_for(document_type);
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(RenderError::UnknownTemplate(document_type.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RenderError::UnknownTemplate(document_type.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let modified = metadata.modified()?;

        let cached = mutex_lock(&self.entries, SOURCE, "load.lookup")
            .get(&path)
            .cloned();
        if let Some(cached) = cached
            && cached.modified == modified
        {
            return Ok(cached.source.clone());
        }

        let source: Arc<str> = fs::read_to_string(&path).await?.into();
        debug!(
            target = "papyrus::render::templates",
            path = %path.display(),
            "template loaded"
        );
        mutex_lock(&self.entries, SOURCE, "load.store").put(
            path,
            CachedTemplate {
                modified,
                source: source.clone(),
            },
        );
        Ok(source)
    }

    pub fn invalidate(&self, document_type: DocumentType) {
        let path = self.path_for(document_type);
        mutex_lock(&self.entries, SOURCE, "invalidate").pop(&path);
    }

    pub fn clear(&self) {
        mutex_lock(&self.entries, SOURCE, "clear").clear();
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metadata of `document_type`'s template, if its file is present.
    pub async fn describe(&self, document_type: DocumentType) -> Option<TemplateFile> {
        let metadata = fs::metadata(self.path_for(document_type)).await.ok()?;
        if !metadata.is_file() {
            return None;
        }
        Some(TemplateFile {
            document_type,
            size_bytes: metadata.len(),
            modified: metadata.modified().ok()?,
        })
    }

    pub async fn has_template(&self, document_type: DocumentType) -> bool {
        self.describe(document_type).await.is_some()
    }

    /// Document types with a template file present.
    pub async fn available(&self) -> Vec<DocumentType> {
        let mut found = Vec::new();
        for document_type in DocumentType::ALL {
            if self.has_template(document_type).await {
                found.push(document_type);
            }
        }
        found
    }
}
