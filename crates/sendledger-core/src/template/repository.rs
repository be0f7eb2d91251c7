//! Template storage.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

use super::model::{Folder, FolderId, Template, TemplateId, TemplatePatch};
use crate::error::{Error, Result};

/// Repository for template and folder storage.
#[derive(Debug, Clone)]
pub struct TemplateRepository {
    pool: SqlitePool,
}

impl TemplateRepository {
    /// Create a repository over an existing pool.
    ///
    /// Usually obtained through [`crate::Store::templates`].
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize database schema.
    pub(crate) async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS template_folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                subject TEXT NOT NULL,
                content TEXT NOT NULL,
                folder_id INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Create a folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn create_folder(&self, name: &str) -> Result<Folder> {
        let inserted = sqlx::query("INSERT INTO template_folders (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(Folder {
            id: FolderId::new(inserted.last_insert_rowid()),
            name: name.to_string(),
        })
    }

    /// List all folders, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_folders(&self) -> Result<Vec<Folder>> {
        let rows = sqlx::query("SELECT id, name FROM template_folders ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| Folder {
                id: FolderId::new(row.get("id")),
                name: row.get("name"),
            })
            .collect())
    }

    /// Create a template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContent`] if the content tree fails
    /// validation.
    pub async fn create(&self, template: Template) -> Result<Template> {
        template.content.validate()?;
        let content_json = serde_json::to_string(&template.content)?;
        let now = Utc::now();

        let inserted = sqlx::query(
            r"
            INSERT INTO templates (name, subject, content, folder_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&template.name)
        .bind(&template.subject)
        .bind(&content_json)
        .bind(template.folder_id.map(|f| f.0))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Template {
            id: Some(TemplateId::new(inserted.last_insert_rowid())),
            created_at: Some(now),
            updated_at: Some(now),
            ..template
        })
    }

    /// Get a template by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: TemplateId) -> Result<Option<Template>> {
        let row = sqlx::query(
            r"
            SELECT id, name, subject, content, folder_id, created_at, updated_at
            FROM templates
            WHERE id = ?
            ",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_template(&r)).transpose()
    }

    /// List templates, optionally restricted to one folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self, folder: Option<FolderId>) -> Result<Vec<Template>> {
        let rows = match folder {
            Some(folder_id) => {
                sqlx::query(
                    r"
                    SELECT id, name, subject, content, folder_id, created_at, updated_at
                    FROM templates
                    WHERE folder_id = ?
                    ORDER BY name
                    ",
                )
                .bind(folder_id.0)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r"
                    SELECT id, name, subject, content, folder_id, created_at, updated_at
                    FROM templates
                    ORDER BY name
                    ",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_template).collect()
    }

    /// Apply a patch to a template.
    ///
    /// New content is validated before anything is written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TemplateNotFound`] if missing, or
    /// [`Error::InvalidContent`] if the patched content is invalid.
    pub async fn update(&self, id: TemplateId, patch: TemplatePatch) -> Result<()> {
        let current = self.get(id).await?.ok_or(Error::TemplateNotFound(id))?;

        let name = patch.name.unwrap_or(current.name);
        let subject = patch.subject.unwrap_or(current.subject);
        let content = patch.content.unwrap_or(current.content);
        let folder_id = patch.folder_id.unwrap_or(current.folder_id);

        content.validate()?;
        let content_json = serde_json::to_string(&content)?;

        sqlx::query(
            r"
            UPDATE templates
            SET name = ?, subject = ?, content = ?, folder_id = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(&name)
        .bind(&subject)
        .bind(&content_json)
        .bind(folder_id.map(|f| f.0))
        .bind(Utc::now())
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Create a decoupled copy of a template.
    ///
    /// The copy owns its own content arena; editing either never affects
    /// the other.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TemplateNotFound`] if the source is missing.
    pub async fn duplicate(&self, id: TemplateId) -> Result<Template> {
        let source = self.get(id).await?.ok_or(Error::TemplateNotFound(id))?;

        self.create(Template::new(
            format!("{} (copy)", source.name),
            source.subject,
            source.content,
            source.folder_id,
        ))
        .await
    }

    /// Delete a template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TemplateInUse`] while any campaign in draft,
    /// scheduled, or sending state references the template. Finished
    /// campaigns hold their own content snapshot and do not block deletion.
    pub async fn delete(&self, id: TemplateId) -> Result<()> {
        let active: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*)
            FROM campaigns
            WHERE template_id = ? AND status IN ('draft', 'scheduled', 'sending')
            ",
        )
        .bind(id.0)
        .fetch_one(&self.pool)
        .await?;

        if active > 0 {
            return Err(Error::TemplateInUse(id));
        }

        sqlx::query("DELETE FROM templates WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Convert a database row to a `Template`.
fn row_to_template(row: &SqliteRow) -> Result<Template> {
    let content_json: String = row.get("content");
    Ok(Template {
        id: Some(TemplateId::new(row.get("id"))),
        name: row.get("name"),
        subject: row.get("subject"),
        content: serde_json::from_str(&content_json)?,
        folder_id: row.get::<Option<i64>, _>("folder_id").map(FolderId::new),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
