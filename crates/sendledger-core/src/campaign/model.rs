//! Campaign data models and lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::segment::SegmentId;
use crate::template::TemplateId;

/// Unique identifier for a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CampaignId(pub i64);

impl CampaignId {
    /// Create a new campaign ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CampaignId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Campaign lifecycle status.
///
/// All legal moves go through [`CampaignStatus::can_transition`]; callers
/// never compare status strings. Terminal states (`Sent`, `Failed`,
/// `Cancelled`) admit no further transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CampaignStatus {
    /// Being composed; template/segment may still change.
    #[default]
    Draft,
    /// Bound to a template and segment, waiting for its send time.
    Scheduled,
    /// Audience frozen, dispatch in progress.
    Sending,
    /// Dispatch completed. Per-recipient failures live in the ledger;
    /// campaign-level `Sent` does not mean every message was delivered.
    Sent,
    /// Dispatch could not proceed at all (e.g., transport auth failure).
    Failed,
    /// Abandoned before dispatch began.
    Cancelled,
}

impl CampaignStatus {
    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "scheduled" => Self::Scheduled,
            "sending" => Self::Sending,
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Draft,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }

    /// The single transition table for the campaign lifecycle.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Draft, Self::Scheduled | Self::Cancelled)
                | (Self::Scheduled, Self::Sending | Self::Cancelled)
                | (Self::Sending, Self::Sent | Self::Failed)
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One send operation binding a template snapshot to a resolved audience.
#[derive(Debug, Clone)]
pub struct Campaign {
    /// Unique identifier (None for unsaved campaigns).
    pub id: Option<CampaignId>,
    /// Display name.
    pub name: String,
    /// Template to render. Snapshotted at send time, not a live reference
    /// once sending begins.
    pub template_id: TemplateId,
    /// Audience segment, resolved into a frozen list at send time.
    pub segment_id: SegmentId,
    /// Lifecycle status.
    pub status: CampaignStatus,
    /// When to start sending; None means "on the next dispatch pass".
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Subject snapshot, taken at the scheduled→sending transition.
    pub snapshot_subject: Option<String>,
    /// Rendered body snapshot, taken at the scheduled→sending transition.
    pub snapshot_body: Option<String>,
    /// When the campaign was created.
    pub created_at: Option<DateTime<Utc>>,
    /// When dispatch completed.
    pub sent_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Creates a new draft campaign.
    #[must_use]
    pub fn new(name: impl Into<String>, template_id: TemplateId, segment_id: SegmentId) -> Self {
        Self {
            id: None,
            name: name.into(),
            template_id,
            segment_id,
            status: CampaignStatus::Draft,
            scheduled_for: None,
            snapshot_subject: None,
            snapshot_body: None,
            created_at: None,
            sent_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CampaignStatus; 6] = [
        CampaignStatus::Draft,
        CampaignStatus::Scheduled,
        CampaignStatus::Sending,
        CampaignStatus::Sent,
        CampaignStatus::Failed,
        CampaignStatus::Cancelled,
    ];

    #[test]
    fn status_round_trip() {
        for status in ALL {
            assert_eq!(CampaignStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn terminal_states_admit_no_transition() {
        for from in ALL {
            if !from.is_terminal() {
                continue;
            }
            for to in ALL {
                assert!(!from.can_transition(to), "{from} -> {to} should be illegal");
            }
        }
    }

    #[test]
    fn lifecycle_path_is_legal() {
        assert!(CampaignStatus::Draft.can_transition(CampaignStatus::Scheduled));
        assert!(CampaignStatus::Scheduled.can_transition(CampaignStatus::Sending));
        assert!(CampaignStatus::Sending.can_transition(CampaignStatus::Sent));
        assert!(CampaignStatus::Sending.can_transition(CampaignStatus::Failed));
    }

    #[test]
    fn cancel_only_before_sending() {
        assert!(CampaignStatus::Draft.can_transition(CampaignStatus::Cancelled));
        assert!(CampaignStatus::Scheduled.can_transition(CampaignStatus::Cancelled));
        assert!(!CampaignStatus::Sending.can_transition(CampaignStatus::Cancelled));
    }

    #[test]
    fn no_skipping_states() {
        assert!(!CampaignStatus::Draft.can_transition(CampaignStatus::Sending));
        assert!(!CampaignStatus::Draft.can_transition(CampaignStatus::Sent));
        assert!(!CampaignStatus::Scheduled.can_transition(CampaignStatus::Sent));
    }
}
