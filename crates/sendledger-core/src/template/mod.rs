//! Template store: named, foldered message templates with structured content.

mod content;
mod model;
mod repository;

pub use content::{Block, BlockId, BlockKind, ContentTree};
pub use model::{Folder, FolderId, Template, TemplateId, TemplatePatch};
pub use repository::TemplateRepository;
