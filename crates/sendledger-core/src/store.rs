//! Shared `SQLite` store backing all repositories.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::campaign::CampaignRepository;
use crate::delivery::{DeliveryRepository, DeliveryTracker};
use crate::error::Result;
use crate::recipient::RecipientRepository;
use crate::segment::SegmentRepository;
use crate::template::TemplateRepository;

/// Owns the connection pool and hands out repository views over it.
///
/// All repositories share one pool so cross-table operations (audience
/// freezes, template in-use checks, unsubscribe feedback) see one database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and runs schema
    /// setup for every repository.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or initialized.
    pub async fn open(path: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{path}?mode=rwc"))
            .await?;
        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Creates an in-memory store for tests.
    ///
    /// # Errors
    /// Returns an error if the in-memory database cannot be created.
    pub async fn in_memory() -> Result<Self> {
        // A second connection would see a different empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        self.recipients().initialize().await?;
        self.segments().initialize().await?;
        self.templates().initialize().await?;
        self.campaigns().initialize().await?;
        self.deliveries().initialize().await?;
        Ok(())
    }

    /// Recipient directory.
    #[must_use]
    pub fn recipients(&self) -> RecipientRepository {
        RecipientRepository::new(self.pool.clone())
    }

    /// Segment definitions and evaluation.
    #[must_use]
    pub fn segments(&self) -> SegmentRepository {
        SegmentRepository::new(self.pool.clone())
    }

    /// Template and folder storage.
    #[must_use]
    pub fn templates(&self) -> TemplateRepository {
        TemplateRepository::new(self.pool.clone())
    }

    /// Campaign lifecycle and scheduling.
    #[must_use]
    pub fn campaigns(&self) -> CampaignRepository {
        CampaignRepository::new(self.pool.clone())
    }

    /// Per-recipient delivery ledger.
    #[must_use]
    pub fn deliveries(&self) -> DeliveryRepository {
        DeliveryRepository::new(self.pool.clone())
    }

    /// Event ingestion pipeline over the ledger and the directory.
    #[must_use]
    pub fn tracker(&self) -> DeliveryTracker {
        DeliveryTracker::new(self.deliveries(), self.recipients())
    }
}
