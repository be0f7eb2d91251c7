//! Error types for the core library.

use thiserror::Error;

use crate::campaign::{CampaignId, CampaignStatus};
use crate::recipient::RecipientId;
use crate::segment::SegmentId;
use crate::template::TemplateId;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Outbound transport or inbound event boundary failed.
    #[error("Transport error: {0}")]
    Transport(#[from] sendledger_transport::Error),

    /// A recipient with this email address already exists.
    #[error("Recipient already exists: {0}")]
    DuplicateRecipient(String),

    /// Recipient not found.
    #[error("Recipient not found: {0}")]
    RecipientNotFound(RecipientId),

    /// Segment not found.
    #[error("Segment not found: {0}")]
    SegmentNotFound(SegmentId),

    /// Template not found.
    #[error("Template not found: {0}")]
    TemplateNotFound(TemplateId),

    /// Campaign not found.
    #[error("Campaign not found: {0}")]
    CampaignNotFound(CampaignId),

    /// No delivery record matches the transport's message identifier.
    #[error("Unknown delivery record: {0}")]
    UnknownDeliveryRecord(String),

    /// Inbound event names an event type we do not recognize.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Segment filter expression failed validation.
    #[error("Invalid filter expression: {0}")]
    InvalidFilterExpression(String),

    /// Template content tree failed validation.
    #[error("Invalid template content: {0}")]
    InvalidContent(String),

    /// Template is referenced by a campaign that has not finished.
    #[error("Template {0} is in use by an active campaign")]
    TemplateInUse(TemplateId),

    /// Campaign schedule is not acceptable.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Campaign state machine rejected the transition.
    #[error("Invalid campaign transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: CampaignStatus,
        /// Requested status.
        to: CampaignStatus,
    },

    /// Campaign already completed dispatch and cannot be sent again.
    #[error("Campaign {0} has already been sent")]
    CampaignAlreadySent(CampaignId),

    /// A row stayed contended past the bounded retry count.
    #[error("Concurrent update contention on {entity} {id}")]
    Contention {
        /// What kind of row was contended.
        entity: &'static str,
        /// The contended row's id.
        id: i64,
    },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
