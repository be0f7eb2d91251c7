//! Delivery record storage.
//!
//! The `delivery_records` table is the single source of truth for send
//! status. The orchestrator performs the initial queued→sent/failed
//! transition; the tracker appends transport events. Both paths go through
//! compare-and-set updates so concurrent writers cannot interleave into an
//! inconsistent history.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

use super::model::{DeliveryEvent, DeliveryRecord, DeliveryRecordId, DeliveryStatus, EventType};
use crate::campaign::CampaignId;
use crate::error::{Error, Result};
use crate::recipient::RecipientId;

/// Bounded retry for contended status updates on one record.
const MAX_CAS_ATTEMPTS: u32 = 8;

/// A queued record joined with the addressing data dispatch needs.
#[derive(Debug, Clone)]
pub struct QueuedDelivery {
    /// The delivery record id.
    pub record_id: DeliveryRecordId,
    /// Targeted recipient.
    pub recipient_id: RecipientId,
    /// Recipient email address.
    pub email: String,
    /// Recipient display name.
    pub name: String,
}

/// Inserts a queued record for one (campaign, recipient) pair.
///
/// `INSERT OR IGNORE` against the unique key makes audience freezing
/// idempotent: re-running it can never create a second record.
pub(crate) async fn insert_queued<'e, E>(
    executor: E,
    campaign_id: CampaignId,
    recipient_id: RecipientId,
    now: DateTime<Utc>,
) -> Result<()>
where
    E: sqlx::SqliteExecutor<'e>,
{
    sqlx::query(
        r"
        INSERT OR IGNORE INTO delivery_records
            (campaign_id, recipient_id, status, created_at, updated_at)
        VALUES (?, ?, 'queued', ?, ?)
        ",
    )
    .bind(campaign_id.0)
    .bind(recipient_id.0)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(())
}

/// Repository for the delivery ledger.
#[derive(Debug, Clone)]
pub struct DeliveryRepository {
    pool: SqlitePool,
}

impl DeliveryRepository {
    /// Create a repository over an existing pool.
    ///
    /// Usually obtained through [`crate::Store::deliveries`].
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize database schema.
    pub(crate) async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS delivery_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL,
                recipient_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                external_id TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(campaign_id, recipient_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_delivery_records_external
            ON delivery_records(external_id)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS delivery_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_delivery_events_record
            ON delivery_events(record_id)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Create a queued record for a (campaign, recipient) pair.
    ///
    /// Idempotent per the unique key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn create_queued(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
    ) -> Result<()> {
        insert_queued(&self.pool, campaign_id, recipient_id, Utc::now()).await
    }

    /// Get a record by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: DeliveryRecordId) -> Result<Option<DeliveryRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, campaign_id, recipient_id, status, external_id, error,
                   created_at, updated_at
            FROM delivery_records
            WHERE id = ?
            ",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| row_to_record(&r)))
    }

    /// Get the record for one (campaign, recipient) pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_for(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
    ) -> Result<Option<DeliveryRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, campaign_id, recipient_id, status, external_id, error,
                   created_at, updated_at
            FROM delivery_records
            WHERE campaign_id = ? AND recipient_id = ?
            ",
        )
        .bind(campaign_id.0)
        .bind(recipient_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| row_to_record(&r)))
    }

    /// Look up a record by the transport's message identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_by_external_id(&self, external_id: &str) -> Result<Option<DeliveryRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, campaign_id, recipient_id, status, external_id, error,
                   created_at, updated_at
            FROM delivery_records
            WHERE external_id = ?
            ",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| row_to_record(&r)))
    }

    /// All records for a campaign, ordered by recipient id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<DeliveryRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, campaign_id, recipient_id, status, external_id, error,
                   created_at, updated_at
            FROM delivery_records
            WHERE campaign_id = ?
            ORDER BY recipient_id
            ",
        )
        .bind(campaign_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_record).collect())
    }

    /// Still-queued records for a campaign joined with recipient addressing,
    /// ordered by recipient id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn queued_for(&self, campaign_id: CampaignId) -> Result<Vec<QueuedDelivery>> {
        let rows = sqlx::query(
            r"
            SELECT d.id AS record_id, d.recipient_id, r.email, r.name
            FROM delivery_records d
            JOIN recipients r ON r.id = d.recipient_id
            WHERE d.campaign_id = ? AND d.status = 'queued'
            ORDER BY d.recipient_id
            ",
        )
        .bind(campaign_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| QueuedDelivery {
                record_id: DeliveryRecordId::new(row.get("record_id")),
                recipient_id: RecipientId::new(row.get("recipient_id")),
                email: row.get("email"),
                name: row.get("name"),
            })
            .collect())
    }

    /// Number of records for a campaign still awaiting dispatch.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn queued_count(&self, campaign_id: CampaignId) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM delivery_records WHERE campaign_id = ? AND status = 'queued'",
        )
        .bind(campaign_id.0)
        .fetch_one(&self.pool)
        .await?;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(count as u32)
    }

    /// Record a successful submission: queued → sent, with external id.
    ///
    /// Returns false if the record had already left `queued`, which a
    /// dispatch retry after a crash treats as done.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn mark_submitted(
        &self,
        id: DeliveryRecordId,
        external_id: &str,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r"
            UPDATE delivery_records
            SET status = 'sent', external_id = ?, updated_at = ?
            WHERE id = ? AND status = 'queued'
            ",
        )
        .bind(external_id)
        .bind(Utc::now())
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    /// Record a permanent submission failure: queued → failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn mark_failed(&self, id: DeliveryRecordId, error: &str) -> Result<bool> {
        let updated = sqlx::query(
            r"
            UPDATE delivery_records
            SET status = 'failed', error = ?, updated_at = ?
            WHERE id = ? AND status = 'queued'
            ",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    /// Append a transport event to a record and advance its status.
    ///
    /// The event is always appended to history; the status moves
    /// forward-only per [`DeliveryStatus::apply`]. The append and the
    /// status change commit in one transaction, guarded by a
    /// compare-and-set on the status column so two concurrent events for
    /// the same record serialize instead of losing updates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDeliveryRecord`] if no record carries this
    /// external id, or [`Error::Contention`] if the record stayed contended
    /// past the retry bound.
    pub async fn record_event(
        &self,
        external_id: &str,
        event: EventType,
        occurred_at: DateTime<Utc>,
    ) -> Result<DeliveryRecord> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = self
                .get_by_external_id(external_id)
                .await?
                .ok_or_else(|| Error::UnknownDeliveryRecord(external_id.to_string()))?;

            let next = record.status.apply(event);
            let now = Utc::now();

            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r"
                INSERT INTO delivery_events (record_id, event_type, occurred_at, recorded_at)
                VALUES (?, ?, ?, ?)
                ",
            )
            .bind(record.id.0)
            .bind(event.as_str())
            .bind(occurred_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let updated = sqlx::query(
                r"
                UPDATE delivery_records
                SET status = ?, updated_at = ?
                WHERE id = ? AND status = ?
                ",
            )
            .bind(next.as_str())
            .bind(now)
            .bind(record.id.0)
            .bind(record.status.as_str())
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 1 {
                tx.commit().await?;
                return Ok(DeliveryRecord {
                    status: next,
                    updated_at: Some(now),
                    ..record
                });
            }

            // Another writer moved the status; drop the event insert and
            // recompute against the fresh row.
            tx.rollback().await?;
        }

        let record = self
            .get_by_external_id(external_id)
            .await?
            .ok_or_else(|| Error::UnknownDeliveryRecord(external_id.to_string()))?;
        Err(Error::Contention {
            entity: "delivery record",
            id: record.id.0,
        })
    }

    /// Ordered transition history for a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn history(&self, id: DeliveryRecordId) -> Result<Vec<DeliveryEvent>> {
        let rows = sqlx::query(
            r"
            SELECT event_type, occurred_at, recorded_at
            FROM delivery_events
            WHERE record_id = ?
            ORDER BY id
            ",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let event_type = EventType::parse(row.get("event_type"))?;
                Some(DeliveryEvent {
                    event_type,
                    occurred_at: row.get("occurred_at"),
                    recorded_at: row.get("recorded_at"),
                })
            })
            .collect())
    }
}

/// Convert a database row to a `DeliveryRecord`.
fn row_to_record(row: &SqliteRow) -> DeliveryRecord {
    DeliveryRecord {
        id: DeliveryRecordId::new(row.get("id")),
        campaign_id: CampaignId::new(row.get("campaign_id")),
        recipient_id: RecipientId::new(row.get("recipient_id")),
        status: DeliveryStatus::parse(row.get("status")),
        external_id: row.get("external_id"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
