//! Rendering port: turns a validated document request into PDF bytes
//! inside a pooled render context.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use thiserror::Error;

use crate::domain::documents::DocumentRequest;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no template for document type `{0}`")]
    UnknownTemplate(String),
    #[error("typesetter rejected the document (exit status {status}): {stderr}")]
    Rejected { status: String, stderr: String },
    #[error("typesetter produced no output")]
    EmptyOutput,
    #[error("typesetter could not be launched: {0}")]
    Launch(String),
    #[error("render timed out after {0:?}")]
    Timeout(Duration),
    #[error("render workspace io failed: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    /// Errors that will recur on retry: the input itself is at fault.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::UnknownTemplate(_) | Self::Rejected { .. } | Self::EmptyOutput
        )
    }
}

/// Scratch workspace owned by one pool slot. Dropping it removes the
/// directory.
#[derive(Debug)]
pub struct RenderContext {
    workspace: TempDir,
    renders: u64,
}

impl RenderContext {
    pub fn new(workspace: TempDir) -> Self {
        Self {
            workspace,
            renders: 0,
        }
    }

    pub fn path(&self) -> &Path {
        self.workspace.path()
    }

    /// Number of documents rendered in this context since it was created.
    pub fn renders(&self) -> u64 {
        self.renders
    }

    pub fn record_render(&mut self) {
        self.renders += 1;
    }

    pub fn into_workspace(self) -> TempDir {
        self.workspace
    }
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(
        &self,
        context: &mut RenderContext,
        request: &DocumentRequest,
    ) -> Result<Bytes, RenderError>;

    /// Verify the rendering engine is usable; returns a version string.
    async fn check(&self) -> Result<String, RenderError>;
}
