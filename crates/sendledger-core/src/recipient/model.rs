//! Recipient directory data models.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecipientId(pub i64);

impl RecipientId {
    /// Create a new recipient ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RecipientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contact that campaigns can be addressed to.
///
/// Email addresses are unique case-insensitively and stored lowercased.
/// Recipients referenced by delivery history are soft-deleted, never removed.
#[derive(Debug, Clone)]
pub struct Recipient {
    /// Unique identifier (None for unsaved recipients).
    pub id: Option<RecipientId>,
    /// Email address, normalized to lowercase.
    pub email: String,
    /// Display name.
    pub name: String,
    /// Free-form attributes used for segmentation (e.g., tier=gold).
    pub attributes: BTreeMap<String, String>,
    /// Whether the recipient has opted out of all sends.
    pub unsubscribed: bool,
    /// When the unsubscribe took effect.
    pub unsubscribed_at: Option<DateTime<Utc>>,
    /// Why the recipient was unsubscribed (event type or "manual").
    pub unsubscribe_reason: Option<String>,
    /// When the recipient was created.
    pub created_at: Option<DateTime<Utc>>,
}

impl Recipient {
    /// Creates a new unsaved recipient with a normalized email address.
    #[must_use]
    pub fn new(
        email: impl Into<String>,
        name: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: None,
            email: email.into().trim().to_lowercase(),
            name: name.into().trim().to_string(),
            attributes,
            unsubscribed: false,
            unsubscribed_at: None,
            unsubscribe_reason: None,
            created_at: None,
        }
    }
}

/// A partial update to a recipient's attribute map.
///
/// `Some(value)` sets the key, `None` removes it. Keys absent from the
/// patch are left untouched.
pub type AttributePatch = BTreeMap<String, Option<String>>;
