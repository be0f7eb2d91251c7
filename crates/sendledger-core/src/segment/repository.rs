//! Segment storage and audience evaluation.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

use super::model::{FilterExpr, Segment, SegmentId};
use crate::error::{Error, Result};
use crate::recipient::{Recipient, row_to_recipient};

/// Recipient rows eligible for any audience: soft-deleted and unsubscribed
/// recipients are excluded unconditionally, ordering by id keeps repeated
/// evaluations deterministic.
pub(crate) const AUDIENCE_QUERY: &str = r"
    SELECT id, email, name, attributes, unsubscribed, unsubscribed_at,
           unsubscribe_reason, created_at
    FROM recipients
    WHERE deleted = 0 AND unsubscribed = 0
    ORDER BY id
";

/// Applies a filter expression to eligible recipient rows.
pub(crate) fn apply_filter(rows: &[SqliteRow], filter: &FilterExpr) -> Result<Vec<Recipient>> {
    let mut audience = Vec::new();
    for row in rows {
        let recipient = row_to_recipient(row)?;
        if filter.matches(&recipient.attributes) {
            audience.push(recipient);
        }
    }
    Ok(audience)
}

/// Repository for segment storage and evaluation.
#[derive(Debug, Clone)]
pub struct SegmentRepository {
    pool: SqlitePool,
}

impl SegmentRepository {
    /// Create a repository over an existing pool.
    ///
    /// Usually obtained through [`crate::Store::segments`].
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize database schema.
    pub(crate) async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                filter TEXT NOT NULL,
                cached_count INTEGER,
                evaluated_at TEXT,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Create a new segment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFilterExpression`] if the filter fails
    /// structural validation.
    pub async fn create(&self, segment: Segment) -> Result<Segment> {
        segment.filter.validate(None)?;
        let filter_json = serde_json::to_string(&segment.filter)?;
        let created_at = Utc::now();

        let inserted = sqlx::query(
            r"
            INSERT INTO segments (name, filter, created_at)
            VALUES (?, ?, ?)
            ",
        )
        .bind(&segment.name)
        .bind(&filter_json)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(Segment {
            id: Some(SegmentId::new(inserted.last_insert_rowid())),
            created_at: Some(created_at),
            ..segment
        })
    }

    /// Get a segment by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: SegmentId) -> Result<Option<Segment>> {
        let row = sqlx::query(
            r"
            SELECT id, name, filter, cached_count, evaluated_at, created_at
            FROM segments
            WHERE id = ?
            ",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_segment(&r)).transpose()
    }

    /// List all segments, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self) -> Result<Vec<Segment>> {
        let rows = sqlx::query(
            r"
            SELECT id, name, filter, cached_count, evaluated_at, created_at
            FROM segments
            ORDER BY id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_segment).collect()
    }

    /// Replace a segment's name and/or filter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SegmentNotFound`] if missing, or
    /// [`Error::InvalidFilterExpression`] if the new filter is invalid.
    pub async fn update(
        &self,
        id: SegmentId,
        name: Option<&str>,
        filter: Option<&FilterExpr>,
    ) -> Result<()> {
        let current = self.get(id).await?.ok_or(Error::SegmentNotFound(id))?;

        let new_name = name.unwrap_or(&current.name);
        let new_filter = filter.unwrap_or(&current.filter);
        new_filter.validate(None)?;
        let filter_json = serde_json::to_string(new_filter)?;

        // A changed filter invalidates the cached audience count.
        sqlx::query(
            r"
            UPDATE segments
            SET name = ?, filter = ?, cached_count = NULL, evaluated_at = NULL
            WHERE id = ?
            ",
        )
        .bind(new_name)
        .bind(&filter_json)
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, id: SegmentId) -> Result<()> {
        sqlx::query("DELETE FROM segments WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Evaluate a segment into its current audience.
    ///
    /// The result is ordered by recipient id, deduplicated by construction,
    /// and never contains unsubscribed or deleted recipients. The segment's
    /// cached count is refreshed as a side effect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SegmentNotFound`] if missing, or
    /// [`Error::InvalidFilterExpression`] if the stored filter no longer
    /// validates.
    pub async fn evaluate(&self, id: SegmentId) -> Result<Vec<Recipient>> {
        let segment = self.get(id).await?.ok_or(Error::SegmentNotFound(id))?;
        segment.filter.validate(None)?;

        let rows = sqlx::query(AUDIENCE_QUERY).fetch_all(&self.pool).await?;
        let audience = apply_filter(&rows, &segment.filter)?;

        #[allow(clippy::cast_possible_truncation)]
        let count = audience.len() as u32;
        sqlx::query("UPDATE segments SET cached_count = ?, evaluated_at = ? WHERE id = ?")
            .bind(i64::from(count))
            .bind(Utc::now())
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(audience)
    }

    /// Current audience size for a segment.
    ///
    /// Always re-evaluates; this is the "preview audience size" operation
    /// and must agree with the list a send at this instant would freeze.
    ///
    /// # Errors
    ///
    /// Returns an error if evaluation fails.
    pub async fn preview_count(&self, id: SegmentId) -> Result<usize> {
        Ok(self.evaluate(id).await?.len())
    }
}

/// Convert a database row to a `Segment`.
fn row_to_segment(row: &SqliteRow) -> Result<Segment> {
    let filter_json: String = row.get("filter");
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(Segment {
        id: Some(SegmentId::new(row.get("id"))),
        name: row.get("name"),
        filter: serde_json::from_str(&filter_json)?,
        cached_count: row
            .get::<Option<i64>, _>("cached_count")
            .map(|c| c as u32),
        evaluated_at: row.get("evaluated_at"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::segment::CompareOp;
    use crate::store::Store;

    async fn seed_recipient(store: &Store, email: &str, pairs: &[(&str, &str)]) -> Recipient {
        let attributes: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        store
            .recipients()
            .add(Recipient::new(email, "", attributes))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn evaluate_excludes_unsubscribed_regardless_of_match() {
        let store = Store::in_memory().await.unwrap();
        let recipients = store.recipients();
        let segments = store.segments();

        let a = seed_recipient(&store, "a@example.com", &[("tier", "gold")]).await;
        seed_recipient(&store, "b@example.com", &[("tier", "silver")]).await;
        let c = seed_recipient(&store, "c@example.com", &[("tier", "gold")]).await;
        recipients
            .mark_unsubscribed(c.id.unwrap(), "manual", Utc::now())
            .await
            .unwrap();

        let segment = segments
            .create(Segment::new("gold", FilterExpr::equals("tier", "gold")))
            .await
            .unwrap();

        let audience = segments.evaluate(segment.id.unwrap()).await.unwrap();
        let ids: Vec<_> = audience.iter().map(|r| r.id.unwrap()).collect();
        assert_eq!(ids, vec![a.id.unwrap()]);
    }

    #[tokio::test]
    async fn evaluation_is_deterministic() {
        let store = Store::in_memory().await.unwrap();
        let segments = store.segments();

        for i in 0..10 {
            seed_recipient(&store, &format!("r{i}@example.com"), &[("tier", "gold")]).await;
        }

        let segment = segments
            .create(Segment::new("gold", FilterExpr::equals("tier", "gold")))
            .await
            .unwrap();
        let id = segment.id.unwrap();

        let first: Vec<_> = segments
            .evaluate(id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id.unwrap())
            .collect();
        let second: Vec<_> = segments
            .evaluate(id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id.unwrap())
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 10);
    }

    #[tokio::test]
    async fn evaluation_refreshes_cached_count() {
        let store = Store::in_memory().await.unwrap();
        let segments = store.segments();

        seed_recipient(&store, "a@example.com", &[("tier", "gold")]).await;
        let segment = segments
            .create(Segment::new("gold", FilterExpr::equals("tier", "gold")))
            .await
            .unwrap();
        let id = segment.id.unwrap();

        assert!(segments.get(id).await.unwrap().unwrap().cached_count.is_none());
        segments.evaluate(id).await.unwrap();

        let cached = segments.get(id).await.unwrap().unwrap();
        assert_eq!(cached.cached_count, Some(1));
        assert!(cached.evaluated_at.is_some());
    }

    #[tokio::test]
    async fn new_unsubscribe_is_visible_on_next_evaluation() {
        let store = Store::in_memory().await.unwrap();
        let segments = store.segments();

        let a = seed_recipient(&store, "a@example.com", &[("tier", "gold")]).await;
        let segment = segments
            .create(Segment::new("gold", FilterExpr::equals("tier", "gold")))
            .await
            .unwrap();
        let id = segment.id.unwrap();

        assert_eq!(segments.preview_count(id).await.unwrap(), 1);

        store
            .recipients()
            .mark_unsubscribed(a.id.unwrap(), "manual", Utc::now())
            .await
            .unwrap();
        assert_eq!(segments.preview_count(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_rejects_invalid_filter() {
        let store = Store::in_memory().await.unwrap();
        let segments = store.segments();

        let bad = Segment::new(
            "broken",
            FilterExpr::compare("tier", CompareOp::Equals, None),
        );
        assert!(matches!(
            segments.create(bad).await,
            Err(Error::InvalidFilterExpression(_))
        ));
    }

    #[tokio::test]
    async fn update_invalidates_cached_count() {
        let store = Store::in_memory().await.unwrap();
        let segments = store.segments();

        seed_recipient(&store, "a@example.com", &[("tier", "gold")]).await;
        let segment = segments
            .create(Segment::new("gold", FilterExpr::equals("tier", "gold")))
            .await
            .unwrap();
        let id = segment.id.unwrap();
        segments.evaluate(id).await.unwrap();

        segments
            .update(id, None, Some(&FilterExpr::equals("tier", "silver")))
            .await
            .unwrap();

        let updated = segments.get(id).await.unwrap().unwrap();
        assert!(updated.cached_count.is_none());
        assert_eq!(updated.filter, FilterExpr::equals("tier", "silver"));
    }
}
