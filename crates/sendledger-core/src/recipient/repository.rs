//! Recipient directory storage.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

use super::model::{AttributePatch, Recipient, RecipientId};
use crate::error::{Error, Result};

/// Bounded retry for contended attribute updates on one recipient.
const MAX_CAS_ATTEMPTS: u32 = 8;

/// Repository for recipient storage and retrieval.
///
/// Mutations are transactional per-recipient; the table is shared with the
/// segment engine (reads) and the delivery tracker (unsubscribe writes).
#[derive(Debug, Clone)]
pub struct RecipientRepository {
    pool: SqlitePool,
}

impl RecipientRepository {
    /// Create a repository over an existing pool.
    ///
    /// Usually obtained through [`crate::Store::recipients`].
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize database schema.
    pub(crate) async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS recipients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL DEFAULT '',
                attributes TEXT NOT NULL DEFAULT '{}',
                unsubscribed INTEGER NOT NULL DEFAULT 0,
                unsubscribed_at TEXT,
                unsubscribe_reason TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Add a new recipient.
    ///
    /// The email is matched case-insensitively against existing recipients,
    /// including soft-deleted ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRecipient`] if the email is already present,
    /// or a database error.
    pub async fn add(&self, recipient: Recipient) -> Result<Recipient> {
        let attributes_json = serde_json::to_string(&recipient.attributes)?;
        let created_at = Utc::now();

        let result = sqlx::query(
            r"
            INSERT INTO recipients (email, name, attributes, created_at)
            VALUES (?, ?, ?, ?)
            ",
        )
        .bind(&recipient.email)
        .bind(&recipient.name)
        .bind(&attributes_json)
        .bind(created_at)
        .execute(&self.pool)
        .await;

        let inserted = match result {
            Ok(done) => done,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(Error::DuplicateRecipient(recipient.email));
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Recipient {
            id: Some(RecipientId::new(inserted.last_insert_rowid())),
            created_at: Some(created_at),
            ..recipient
        })
    }

    /// Get a recipient by id.
    ///
    /// Soft-deleted recipients are not returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: RecipientId) -> Result<Option<Recipient>> {
        let row = sqlx::query(
            r"
            SELECT id, email, name, attributes, unsubscribed, unsubscribed_at,
                   unsubscribe_reason, created_at
            FROM recipients
            WHERE id = ? AND deleted = 0
            ",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_recipient(&r)).transpose()
    }

    /// Get a recipient by email address (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_by_email(&self, email: &str) -> Result<Option<Recipient>> {
        let normalized = email.trim().to_lowercase();

        let row = sqlx::query(
            r"
            SELECT id, email, name, attributes, unsubscribed, unsubscribed_at,
                   unsubscribe_reason, created_at
            FROM recipients
            WHERE email = ? AND deleted = 0
            ",
        )
        .bind(&normalized)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_recipient(&r)).transpose()
    }

    /// List all recipients, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self) -> Result<Vec<Recipient>> {
        let rows = sqlx::query(
            r"
            SELECT id, email, name, attributes, unsubscribed, unsubscribed_at,
                   unsubscribe_reason, created_at
            FROM recipients
            WHERE deleted = 0
            ORDER BY id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_recipient).collect()
    }

    /// Find recipients matching a predicate, in id order.
    ///
    /// The scan is restarted from the beginning on every call, so repeated
    /// calls over unchanged data return identical sequences.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find<F>(&self, predicate: F) -> Result<Vec<Recipient>>
    where
        F: Fn(&Recipient) -> bool,
    {
        let all = self.list().await?;
        Ok(all.into_iter().filter(|r| predicate(r)).collect())
    }

    /// Apply an attribute patch to a recipient.
    ///
    /// `Some(value)` entries set keys, `None` entries remove them.
    ///
    /// The merge is a compare-and-set on the attributes column: the `UPDATE`
    /// is guarded by the JSON that was read, and a lost race re-reads and
    /// re-merges against the fresh row. Concurrent patches for the same
    /// recipient serialize instead of overwriting each other.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecipientNotFound`] if the recipient does not exist,
    /// or [`Error::Contention`] if the row stayed contended past the retry
    /// bound.
    pub async fn update_attributes(&self, id: RecipientId, patch: &AttributePatch) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let row = sqlx::query("SELECT attributes FROM recipients WHERE id = ? AND deleted = 0")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(Error::RecipientNotFound(id))?;
            let current_json: String = row.get("attributes");

            let mut attributes: std::collections::BTreeMap<String, String> =
                serde_json::from_str(&current_json)?;
            for (key, value) in patch {
                match value {
                    Some(v) => {
                        attributes.insert(key.clone(), v.clone());
                    }
                    None => {
                        attributes.remove(key);
                    }
                }
            }

            let merged_json = serde_json::to_string(&attributes)?;
            let updated = sqlx::query(
                "UPDATE recipients SET attributes = ? WHERE id = ? AND attributes = ?",
            )
            .bind(&merged_json)
            .bind(id.0)
            .bind(&current_json)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 1 {
                return Ok(());
            }
            // Another writer changed the column; merge against the fresh row.
        }

        Err(Error::Contention {
            entity: "recipient",
            id: id.0,
        })
    }

    /// Mark a recipient as unsubscribed.
    ///
    /// Idempotent: the first unsubscribe wins, later calls leave the
    /// original reason and timestamp untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecipientNotFound`] if the recipient does not exist.
    pub async fn mark_unsubscribed(
        &self,
        id: RecipientId,
        reason: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let updated = sqlx::query(
            r"
            UPDATE recipients
            SET unsubscribed = 1, unsubscribed_at = ?, unsubscribe_reason = ?
            WHERE id = ? AND deleted = 0 AND unsubscribed = 0
            ",
        )
        .bind(timestamp)
        .bind(reason)
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            // Already unsubscribed, or missing. Only the latter is an error.
            if self.get(id).await?.is_none() {
                return Err(Error::RecipientNotFound(id));
            }
        }

        Ok(())
    }

    /// Soft-delete a recipient.
    ///
    /// The row stays in place because delivery records reference it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, id: RecipientId) -> Result<()> {
        sqlx::query("UPDATE recipients SET deleted = 1 WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Convert a database row to a `Recipient`.
pub(crate) fn row_to_recipient(row: &SqliteRow) -> Result<Recipient> {
    let attributes_json: String = row.get("attributes");
    Ok(Recipient {
        id: Some(RecipientId::new(row.get("id"))),
        email: row.get("email"),
        name: row.get("name"),
        attributes: serde_json::from_str(&attributes_json)?,
        unsubscribed: row.get::<i64, _>("unsubscribed") != 0,
        unsubscribed_at: row.get("unsubscribed_at"),
        unsubscribe_reason: row.get("unsubscribe_reason"),
        created_at: row.get("created_at"),
    })
}
