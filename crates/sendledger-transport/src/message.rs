//! Outbound message types.

use serde::Serialize;

/// A single send request for one recipient.
#[derive(Debug, Clone, Serialize)]
pub struct SendRequest {
    /// Sender address.
    pub from: String,
    /// Recipient address.
    pub to: String,
    /// Recipient display name, if known.
    pub to_name: Option<String>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body: String,
    /// Caller-supplied deduplication key. Resubmitting with the same key
    /// must not produce a second message.
    pub idempotency_key: String,
}

impl SendRequest {
    /// Creates a new send request.
    #[must_use]
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            to_name: None,
            subject: subject.into(),
            body: body.into(),
            idempotency_key: idempotency_key.into(),
        }
    }

    /// Sets the recipient display name.
    #[must_use]
    pub fn to_name(mut self, name: impl Into<String>) -> Self {
        self.to_name = Some(name.into());
        self
    }
}

/// Acknowledgement returned by the mail API for an accepted submission.
#[derive(Debug, Clone)]
pub struct SubmissionReceipt {
    /// The API's message identifier. Delivery events reference this id.
    pub external_id: String,
}
