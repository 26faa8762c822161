mod templates;
mod typst;
mod workspace;

pub use templates::{TemplateCache, TemplateFile};
pub use typst::TypstRenderer;
pub use workspace::WorkspaceManager;
