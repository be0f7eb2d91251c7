//! Template data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::content::ContentTree;

/// Unique identifier for a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId(pub i64);

impl TemplateId {
    /// Create a new template ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a template folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderId(pub i64);

impl FolderId {
    /// Create a new folder ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A folder grouping templates.
#[derive(Debug, Clone)]
pub struct Folder {
    /// Unique identifier.
    pub id: FolderId,
    /// Folder name.
    pub name: String,
}

/// A reusable message: subject line plus structured content.
#[derive(Debug, Clone)]
pub struct Template {
    /// Unique identifier (None for unsaved templates).
    pub id: Option<TemplateId>,
    /// Display name.
    pub name: String,
    /// Subject line.
    pub subject: String,
    /// Structured content body.
    pub content: ContentTree,
    /// Owning folder, if filed.
    pub folder_id: Option<FolderId>,
    /// When the template was created.
    pub created_at: Option<DateTime<Utc>>,
    /// When the template was last modified.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Template {
    /// Creates a new unsaved template.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        subject: impl Into<String>,
        content: ContentTree,
        folder_id: Option<FolderId>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            subject: subject.into(),
            content,
            folder_id,
            created_at: None,
            updated_at: None,
        }
    }
}

/// A partial update to a template.
///
/// `None` fields are left untouched. `folder_id` is doubly optional so a
/// patch can move a template out of any folder.
#[derive(Debug, Clone, Default)]
pub struct TemplatePatch {
    /// New display name.
    pub name: Option<String>,
    /// New subject line.
    pub subject: Option<String>,
    /// New content body (validated before commit).
    pub content: Option<ContentTree>,
    /// New folder assignment; `Some(None)` unfiles the template.
    pub folder_id: Option<Option<FolderId>>,
}
