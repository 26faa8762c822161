//! Scratch directories backing pooled render contexts.

use std::path::PathBuf;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::fs;
use tracing::debug;

use crate::application::pool::{ResourceError, ResourceManager};
use crate::application::render::RenderContext;

/// Creates one private directory per render context under `parent`.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    parent: PathBuf,
}

impl WorkspaceManager {
    pub fn new(parent: impl Into<PathBuf>) -> Self {
        Self {
            parent: parent.into(),
        }
    }
}

#[async_trait]
impl ResourceManager for WorkspaceManager {
    type Resource = RenderContext;

    async fn create(&self) -> Result<RenderContext, ResourceError> {
        fs::create_dir_all(&self.parent)
            .await
            .map_err(|err| ResourceError::new(format!("workspace parent unavailable: {err}")))?;
        let parent = self.parent.clone();
        let workspace = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix("render-")
                .tempdir_in(parent)
        })
        .await
        .map_err(|err| ResourceError::new(format!("workspace task failed: {err}")))?
        .map_err(|err| ResourceError::new(format!("workspace could not be created: {err}")))?;
        debug!(
            target = "papyrus::render::workspace",
            path = %workspace.path().display(),
            "workspace created"
        );
        Ok(RenderContext::new(workspace))
    }

    /// Empty the directory so the next document starts clean.
    async fn reset(&self, context: &mut RenderContext) -> Result<(), ResourceError> {
        let mut entries = fs::read_dir(context.path())
            .await
            .map_err(|err| ResourceError::new(format!("workspace unreadable: {err}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| ResourceError::new(format!("workspace unreadable: {err}")))?
        {
            let path = entry.path();
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            let removed = if is_dir {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            removed.map_err(|err| {
                ResourceError::new(format!("could not clear {}: {err}", path.display()))
            })?;
        }
        Ok(())
    }

    async fn destroy(&self, context: RenderContext) {
        let workspace: TempDir = context.into_workspace();
        let path = workspace.path().to_path_buf();
        let result = tokio::task::spawn_blocking(move || workspace.close()).await;
        if !matches!(result, Ok(Ok(()))) {
            debug!(
                target = "papyrus::render::workspace",
                path = %path.display(),
                "workspace removal incomplete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reset_clears_files_and_destroy_removes_dir() {
        let parent = TempDir::new().expect("tempdir");
        let manager = WorkspaceManager::new(parent.path());

        let mut context = manager.create().await.expect("create");
        let root = context.path().to_path_buf();
        assert!(root.starts_with(parent.path()));
        std::fs::write(root.join("out.pdf"), b"%PDF").expect("write");
        std::fs::create_dir(root.join("assets")).expect("mkdir");

        manager.reset(&mut context).await.expect("reset");
        assert_eq!(std::fs::read_dir(&root).expect("read dir").count(), 0);

        manager.destroy(context).await;
        assert!(!root.exists());
    }
}
