//! Renders documents by running the external `typst` typesetter inside the
//! leased workspace.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

use crate::application::render::{DocumentRenderer, RenderContext, RenderError};
use crate::domain::documents::{DocumentRequest, Orientation};

use super::templates::TemplateCache;

const TARGET: &str = "papyrus::render::typst";
const MAIN_FILE: &str = "main.typ";
const DATA_FILE: &str = "data.json";
const OUTPUT_FILE: &str = "out.pdf";
const STDERR_LIMIT: usize = 2048;

pub struct TypstRenderer {
    binary: PathBuf,
    templates: Arc<TemplateCache>,
    timeout: Duration,
}

impl TypstRenderer {
    pub fn new(binary: impl Into<PathBuf>, templates: Arc<TemplateCache>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            templates,
            timeout,
        }
    }

    pub fn templates(&self) -> &Arc<TemplateCache> {
        &self.templates
    }

    /// Page and text setup prepended to every template. Templates read the
    /// request through the `doc` binding.
    fn preamble(request: &DocumentRequest) -> String {
        let margins = &request.options.margins;
        let (lang, region) = request
            .language
            .as_str()
            .split_once('-')
            .unwrap_or((request.language.as_str(), ""));
        let flipped = request.options.orientation == Orientation::Landscape;
        format!(
            "#set page(paper: \"{paper}\", flipped: {flipped}, margin: (top: {top}, right: {right}, bottom: {bottom}, left: {left}))\n\
             #set text(lang: \"{lang}\", region: \"{region}\")\n\
             #let doc = json(\"{DATA_FILE}\")\n",
            paper = request.options.format.paper(),
            top = margins.top,
            right = margins.right,
            bottom = margins.bottom,
            left = margins.left,
            lang = lang.to_ascii_lowercase(),
            region = region.to_ascii_uppercase(),
        )
    }

    fn data_file(request: &DocumentRequest) -> Result<Vec<u8>, RenderError> {
        let document = json!({
            "type": request.document_type,
            "title": request.title,
            "language": request.language.as_str(),
            "data": request.data,
        });
        serde_json::to_vec_pretty(&document)
            .map_err(|err| RenderError::Io(std::io::Error::other(err)))
    }
}

fn tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(STDERR_LIMIT)
        .map_or(0, |(index, _)| index);
    trimmed[start..].to_string()
}

#[async_trait]
impl DocumentRenderer for TypstRenderer {
    async fn render(
        &self,
        context: &mut RenderContext,
        request: &DocumentRequest,
    ) -> Result<Bytes, RenderError> {
        let template = self.templates.load(request.document_type).await?;
        let workspace = context.path().to_path_buf();

        let mut main = Self::preamble(request);
        main.push_str(&template);
        fs::write(workspace.join(MAIN_FILE), main).await?;
        fs::write(workspace.join(DATA_FILE), Self::data_file(request)?).await?;

        let child = Command::new(&self.binary)
            .arg("compile")
            .arg(MAIN_FILE)
            .arg(OUTPUT_FILE)
            .current_dir(&workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| RenderError::Launch(format!("{}: {err}", self.binary.display())))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| RenderError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(RenderError::Rejected {
                status: output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |code| code.to_string()),
                stderr: tail(&output.stderr),
            });
        }

        let pdf = match fs::read(workspace.join(OUTPUT_FILE)).await {
            Ok(pdf) => pdf,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RenderError::EmptyOutput);
            }
            Err(err) => return Err(err.into()),
        };
        if pdf.is_empty() {
            return Err(RenderError::EmptyOutput);
        }
        debug!(
            target = TARGET,
            document_type = request.document_type.as_str(),
            bytes = pdf.len(),
            "document compiled"
        );
        Ok(Bytes::from(pdf))
    }

    async fn check(&self) -> Result<String, RenderError> {
        let child = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| RenderError::Launch(format!("{}: {err}", self.binary.display())))?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| RenderError::Timeout(self.timeout))??;
        if !output.status.success() {
            return Err(RenderError::Launch(format!(
                "{} --version exited with {}",
                self.binary.display(),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::num::NonZeroUsize;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::domain::documents::DocumentDraft;

    fn fake_binary(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("typst");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    fn renderer(dir: &TempDir, script: &str, timeout: Duration) -> TypstRenderer {
        let templates = dir.path().join("templates");
        std::fs::create_dir_all(&templates).expect("templates dir");
        std::fs::write(templates.join("report.typ"), "= #doc.title\n").expect("template");
        TypstRenderer::new(
            fake_binary(dir.path(), script),
            Arc::new(TemplateCache::new(templates, NonZeroUsize::MIN)),
            timeout,
        )
    }

    fn request(document_type: &str) -> DocumentRequest {
        DocumentDraft {
            document_type: Some(document_type.into()),
            title: Some("Quarterly".into()),
            orientation: Some("landscape".into()),
            ..DocumentDraft::default()
        }
        .validate()
        .expect("valid request")
    }

    fn context() -> RenderContext {
        RenderContext::new(TempDir::new().expect("workspace"))
    }

    #[tokio::test]
    async fn compiles_in_workspace() {
        let dir = TempDir::new().expect("tempdir");
        let renderer = renderer(
            &dir,
            r#"[ "$1" = compile ] && [ -f main.typ ] && [ -f data.json ] && printf '%%PDF-fake' > "$3""#,
            Duration::from_secs(10),
        );
        let mut context = context();

        let pdf = renderer
            .render(&mut context, &request("report"))
            .await
            .expect("render");
        assert_eq!(pdf, "%PDF-fake");

        let main = std::fs::read_to_string(context.path().join(MAIN_FILE)).expect("main");
        assert!(main.contains("flipped: true"));
        assert!(main.contains("region: \"BR\""));
        assert!(main.ends_with("= #doc.title\n"));
    }

    #[tokio::test]
    async fn failing_exit_is_permanent() {
        let dir = TempDir::new().expect("tempdir");
        let renderer = renderer(
            &dir,
            "echo 'error: unknown variable' >&2; exit 1",
            Duration::from_secs(10),
        );
        let err = renderer
            .render(&mut context(), &request("report"))
            .await
            .expect_err("should fail");
        assert!(err.is_permanent());
        assert!(matches!(err, RenderError::Rejected { ref stderr, .. } if stderr.contains("unknown variable")));
    }

    #[tokio::test]
    async fn missing_output_is_empty() {
        let dir = TempDir::new().expect("tempdir");
        let renderer = renderer(&dir, "exit 0", Duration::from_secs(10));
        let err = renderer
            .render(&mut context(), &request("report"))
            .await
            .expect_err("should fail");
        assert!(matches!(err, RenderError::EmptyOutput));
    }

    #[tokio::test]
    async fn slow_typesetter_times_out_as_transient() {
        let dir = TempDir::new().expect("tempdir");
        let renderer = renderer(&dir, "sleep 5", Duration::from_millis(100));
        let err = renderer
            .render(&mut context(), &request("report"))
            .await
            .expect_err("should time out");
        assert!(matches!(err, RenderError::Timeout(_)));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn unknown_template_is_permanent() {
        let dir = TempDir::new().expect("tempdir");
        let renderer = renderer(&dir, "exit 0", Duration::from_secs(10));
        let err = renderer
            .render(&mut context(), &request("invoice"))
            .await
            .expect_err("no invoice template");
        assert!(matches!(err, RenderError::UnknownTemplate(_)));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn missing_binary_is_launch_error() {
        let dir = TempDir::new().expect("tempdir");
        let renderer = TypstRenderer::new(
            dir.path().join("nope"),
            Arc::new(TemplateCache::new(dir.path(), NonZeroUsize::MIN)),
            Duration::from_secs(1),
        );
        assert!(matches!(renderer.check().await, Err(RenderError::Launch(_))));
    }

    #[tokio::test]
    async fn check_reports_version() {
        let dir = TempDir::new().expect("tempdir");
        let renderer = renderer(&dir, "echo 'typst 0.13.1'", Duration::from_secs(10));
        assert_eq!(renderer.check().await.expect("check"), "typst 0.13.1");
    }
}
