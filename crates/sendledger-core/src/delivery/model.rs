//! Delivery ledger data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::campaign::CampaignId;
use crate::recipient::RecipientId;

/// Unique identifier for a delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryRecordId(pub i64);

impl DeliveryRecordId {
    /// Create a new delivery record ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for DeliveryRecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current status of one recipient's delivery within a campaign.
///
/// The canonical lifecycle is queued < sent < delivered < opened < clicked.
/// Bounced, failed, and unsubscribed are absorbing: once reached, later
/// events are recorded in history but never change the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryStatus {
    /// Record created, not yet submitted to the transport.
    #[default]
    Queued,
    /// Accepted by the transport.
    Sent,
    /// Delivered to the recipient's mailbox.
    Delivered,
    /// Recipient opened the message.
    Opened,
    /// Recipient clicked a link. Implies opened.
    Clicked,
    /// The transport could not deliver.
    Bounced,
    /// Submission failed permanently.
    Failed,
    /// Recipient opted out.
    Unsubscribed,
}

impl DeliveryStatus {
    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "opened" => Self::Opened,
            "clicked" => Self::Clicked,
            "bounced" => Self::Bounced,
            "failed" => Self::Failed,
            "unsubscribed" => Self::Unsubscribed,
            _ => Self::Queued,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Bounced => "bounced",
            Self::Failed => "failed",
            Self::Unsubscribed => "unsubscribed",
        }
    }

    /// Position in the canonical lifecycle ordering.
    #[must_use]
    const fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Opened => 3,
            Self::Clicked => 4,
            // Absorbing states compare by is_absorbing, not rank.
            Self::Bounced | Self::Failed | Self::Unsubscribed => 5,
        }
    }

    /// Whether this status can never be left.
    #[must_use]
    pub const fn is_absorbing(self) -> bool {
        matches!(self, Self::Bounced | Self::Failed | Self::Unsubscribed)
    }

    /// Whether dispatch is finished for this record (any status past
    /// `Queued`). Campaign-level completion counts these.
    #[must_use]
    pub const fn is_dispatched(self) -> bool {
        !matches!(self, Self::Queued)
    }

    /// Applies an event to the current status, forward-only.
    ///
    /// Out-of-order events never regress the status: an event mapping to an
    /// earlier lifecycle position leaves the status unchanged (it is still
    /// appended to history by the caller).
    #[must_use]
    pub const fn apply(self, event: EventType) -> Self {
        if self.is_absorbing() {
            return self;
        }
        let next = event.status();
        if next.is_absorbing() || next.rank() > self.rank() {
            next
        } else {
            self
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delivery event reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Message accepted by the transport.
    Sent,
    /// Message delivered to the mailbox.
    Delivered,
    /// Message opened.
    Opened,
    /// Link clicked.
    Clicked,
    /// Delivery bounced.
    Bounced,
    /// Recipient filed a spam complaint.
    Complained,
    /// Recipient unsubscribed.
    Unsubscribed,
}

impl EventType {
    /// Parse from the transport's wire representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "opened" => Some(Self::Opened),
            "clicked" => Some(Self::Clicked),
            "bounced" => Some(Self::Bounced),
            "complained" => Some(Self::Complained),
            "unsubscribed" => Some(Self::Unsubscribed),
            _ => None,
        }
    }

    /// Convert to string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Bounced => "bounced",
            Self::Complained => "complained",
            Self::Unsubscribed => "unsubscribed",
        }
    }

    /// The status this event maps to.
    #[must_use]
    pub const fn status(self) -> DeliveryStatus {
        match self {
            Self::Sent => DeliveryStatus::Sent,
            Self::Delivered => DeliveryStatus::Delivered,
            Self::Opened => DeliveryStatus::Opened,
            Self::Clicked => DeliveryStatus::Clicked,
            Self::Bounced => DeliveryStatus::Bounced,
            Self::Complained | Self::Unsubscribed => DeliveryStatus::Unsubscribed,
        }
    }

    /// Whether this event must unsubscribe the recipient.
    #[must_use]
    pub const fn unsubscribes(self) -> bool {
        matches!(self, Self::Bounced | Self::Complained | Self::Unsubscribed)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-recipient, per-campaign send/delivery status ledger entry.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    /// Unique identifier.
    pub id: DeliveryRecordId,
    /// Campaign this record belongs to.
    pub campaign_id: CampaignId,
    /// Targeted recipient.
    pub recipient_id: RecipientId,
    /// Current status, forward-only.
    pub status: DeliveryStatus,
    /// The transport's message identifier, set on submission.
    pub external_id: Option<String>,
    /// Last submission error, for failed records.
    pub error: Option<String>,
    /// When the record was created.
    pub created_at: Option<DateTime<Utc>>,
    /// When the status last changed.
    pub updated_at: Option<DateTime<Utc>>,
}

/// One entry in a delivery record's transition history.
#[derive(Debug, Clone)]
pub struct DeliveryEvent {
    /// Event kind.
    pub event_type: EventType,
    /// Event time per the transport's clock.
    pub occurred_at: DateTime<Utc>,
    /// When we ingested the event.
    pub recorded_at: DateTime<Utc>,
}
