//! Campaign persistence, scheduling, and the audience freeze.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::campaign::{Campaign, CampaignId, CampaignStatus};
use crate::delivery::insert_queued;
use crate::error::{Error, Result};
use crate::segment::{AUDIENCE_QUERY, SegmentId, apply_filter};
use crate::template::TemplateId;

/// Repository for campaigns.
#[derive(Debug, Clone)]
pub struct CampaignRepository {
    pool: SqlitePool,
}

impl CampaignRepository {
    /// Create a repository over an existing pool.
    ///
    /// Usually obtained through [`crate::Store::campaigns`].
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize database schema.
    pub(crate) async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS campaigns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                template_id INTEGER NOT NULL,
                segment_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                scheduled_for TIMESTAMP,
                snapshot_subject TEXT,
                snapshot_body TEXT,
                created_at TIMESTAMP NOT NULL,
                sent_at TIMESTAMP
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns (status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Creates a draft campaign.
    ///
    /// # Errors
    /// Returns an error if the referenced template or segment does not exist,
    /// or on a database failure.
    pub async fn create(&self, campaign: Campaign) -> Result<Campaign> {
        self.check_references(campaign.template_id, campaign.segment_id)
            .await?;

        let now = Utc::now();
        let result = sqlx::query(
            r"
            INSERT INTO campaigns (name, template_id, segment_id, status, created_at)
            VALUES (?, ?, ?, 'draft', ?)
            ",
        )
        .bind(&campaign.name)
        .bind(campaign.template_id.0)
        .bind(campaign.segment_id.0)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Campaign {
            id: Some(CampaignId(result.last_insert_rowid())),
            status: CampaignStatus::Draft,
            created_at: Some(now),
            ..campaign
        })
    }

    /// Retrieves a campaign by ID.
    ///
    /// # Errors
    /// Returns an error on a database failure.
    pub async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let row = sqlx::query("SELECT * FROM campaigns WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_campaign).transpose()
    }

    /// Lists all campaigns, newest first.
    ///
    /// # Errors
    /// Returns an error on a database failure.
    pub async fn list(&self) -> Result<Vec<Campaign>> {
        let rows = sqlx::query("SELECT * FROM campaigns ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_campaign).collect()
    }

    /// Moves a draft campaign to `Scheduled`.
    ///
    /// A `None` send time means "on the next dispatch pass"; a set time must
    /// be strictly in the future.
    ///
    /// # Errors
    /// Returns [`Error::InvalidSchedule`] for a past send time,
    /// [`Error::InvalidTransition`] if the campaign is not a draft, or
    /// [`Error::CampaignNotFound`] if it does not exist.
    pub async fn schedule(
        &self,
        id: CampaignId,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<Campaign> {
        let campaign = self.require(id).await?;
        self.check_references(campaign.template_id, campaign.segment_id)
            .await?;

        if let Some(when) = scheduled_for {
            if when <= Utc::now() {
                return Err(Error::InvalidSchedule(format!(
                    "scheduled time {when} is not in the future"
                )));
            }
        }

        let result = sqlx::query(
            "UPDATE campaigns SET status = 'scheduled', scheduled_for = ? \
             WHERE id = ? AND status = 'draft'",
        )
        .bind(scheduled_for)
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidTransition {
                from: self.require(id).await?.status,
                to: CampaignStatus::Scheduled,
            });
        }

        self.require(id).await
    }

    /// Cancels a campaign. Allowed from `Draft` and `Scheduled` only.
    ///
    /// # Errors
    /// Returns [`Error::InvalidTransition`] once sending has begun or the
    /// campaign is terminal, or [`Error::CampaignNotFound`] if it does not
    /// exist.
    pub async fn cancel(&self, id: CampaignId) -> Result<Campaign> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = 'cancelled' \
             WHERE id = ? AND status IN ('draft', 'scheduled')",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidTransition {
                from: self.require(id).await?.status,
                to: CampaignStatus::Cancelled,
            });
        }

        self.require(id).await
    }

    /// Scheduled campaigns whose send time has arrived (or was never set).
    ///
    /// # Errors
    /// Returns an error on a database failure.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let rows = sqlx::query(
            "SELECT * FROM campaigns \
             WHERE status = 'scheduled' AND (scheduled_for IS NULL OR scheduled_for <= ?) \
             ORDER BY id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_campaign).collect()
    }

    /// Campaigns currently in `Sending`, for crash recovery.
    ///
    /// # Errors
    /// Returns an error on a database failure.
    pub async fn in_flight(&self) -> Result<Vec<Campaign>> {
        let rows = sqlx::query("SELECT * FROM campaigns WHERE status = 'sending' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_campaign).collect()
    }

    /// Transitions a campaign to `Sending`, snapshots the rendered content,
    /// and freezes the audience.
    ///
    /// The status flip, the audience evaluation, and the queued-record
    /// inserts run in one transaction, so the frozen list is exactly the
    /// audience at the moment of transition. Template and segment edits
    /// after this point never affect the campaign.
    ///
    /// Calling this on a campaign already in `Sending` is the resume path:
    /// it returns the campaign as-is without touching the frozen list.
    ///
    /// # Errors
    /// Returns [`Error::CampaignAlreadySent`] for a sent campaign,
    /// [`Error::InvalidTransition`] from any other non-scheduled state, and
    /// [`Error::TemplateNotFound`]/[`Error::SegmentNotFound`] if a reference
    /// was deleted since scheduling.
    pub async fn begin_sending(&self, id: CampaignId) -> Result<Campaign> {
        let campaign = self.require(id).await?;
        match campaign.status {
            CampaignStatus::Scheduled => {}
            CampaignStatus::Sending => return Ok(campaign),
            CampaignStatus::Sent => return Err(Error::CampaignAlreadySent(id)),
            from => {
                return Err(Error::InvalidTransition {
                    from,
                    to: CampaignStatus::Sending,
                });
            }
        }

        let template = crate::template::TemplateRepository::new(self.pool.clone())
            .get(campaign.template_id)
            .await?
            .ok_or(Error::TemplateNotFound(campaign.template_id))?;
        let segment = crate::segment::SegmentRepository::new(self.pool.clone())
            .get(campaign.segment_id)
            .await?
            .ok_or(Error::SegmentNotFound(campaign.segment_id))?;

        let subject = template.subject.clone();
        let body = template.content.render_text();

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE campaigns \
             SET status = 'sending', snapshot_subject = ?, snapshot_body = ? \
             WHERE id = ? AND status = 'scheduled'",
        )
        .bind(&subject)
        .bind(&body)
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Lost the race; the other writer owns the freeze.
            tx.rollback().await?;
            return self.require(id).await;
        }

        let rows = sqlx::query(AUDIENCE_QUERY).fetch_all(&mut *tx).await?;
        let audience = apply_filter(&rows, &segment.filter)?;

        let now = Utc::now();
        for recipient in &audience {
            if let Some(recipient_id) = recipient.id {
                insert_queued(&mut *tx, id, recipient_id, now).await?;
            }
        }

        tx.commit().await?;

        tracing::info!(
            campaign_id = %id,
            audience = audience.len(),
            "campaign audience frozen"
        );

        self.require(id).await
    }

    /// Marks dispatch completion: `Sending` to `Sent`, stamping `sent_at`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidTransition`] if the campaign is not sending.
    pub async fn complete(&self, id: CampaignId) -> Result<Campaign> {
        self.finish(id, CampaignStatus::Sent).await
    }

    /// Marks a campaign-level dispatch failure: `Sending` to `Failed`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidTransition`] if the campaign is not sending.
    pub async fn fail(&self, id: CampaignId) -> Result<Campaign> {
        self.finish(id, CampaignStatus::Failed).await
    }

    async fn finish(&self, id: CampaignId, to: CampaignStatus) -> Result<Campaign> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = ?, sent_at = ? WHERE id = ? AND status = 'sending'",
        )
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidTransition {
                from: self.require(id).await?.status,
                to,
            });
        }

        self.require(id).await
    }

    async fn require(&self, id: CampaignId) -> Result<Campaign> {
        self.get(id).await?.ok_or(Error::CampaignNotFound(id))
    }

    async fn check_references(&self, template_id: TemplateId, segment_id: SegmentId) -> Result<()> {
        let template: Option<i64> = sqlx::query_scalar("SELECT id FROM templates WHERE id = ?")
            .bind(template_id.0)
            .fetch_optional(&self.pool)
            .await?;
        if template.is_none() {
            return Err(Error::TemplateNotFound(template_id));
        }

        let segment: Option<i64> = sqlx::query_scalar("SELECT id FROM segments WHERE id = ?")
            .bind(segment_id.0)
            .fetch_optional(&self.pool)
            .await?;
        if segment.is_none() {
            return Err(Error::SegmentNotFound(segment_id));
        }

        Ok(())
    }
}

fn row_to_campaign(row: &SqliteRow) -> Result<Campaign> {
    let status: String = row.try_get("status")?;

    Ok(Campaign {
        id: Some(CampaignId(row.try_get("id")?)),
        name: row.try_get("name")?,
        template_id: TemplateId(row.try_get("template_id")?),
        segment_id: SegmentId(row.try_get("segment_id")?),
        status: CampaignStatus::parse(&status),
        scheduled_for: row.try_get("scheduled_for")?,
        snapshot_subject: row.try_get("snapshot_subject")?,
        snapshot_body: row.try_get("snapshot_body")?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
    })
}
