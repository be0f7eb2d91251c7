//! Ingestion of asynchronous delivery events from the transport.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use sendledger_transport::webhook;

use super::model::{DeliveryRecord, EventType};
use super::repository::DeliveryRepository;
use crate::error::{Error, Result};
use crate::recipient::RecipientRepository;

/// Consumes transport delivery events and keeps the ledger and the
/// recipient directory consistent.
///
/// Events arrive at-least-once and out of order; the tracker appends every
/// event to history, advances record status forward-only, and feeds
/// bounce/complaint/unsubscribe events back into the recipient directory.
#[derive(Debug, Clone)]
pub struct DeliveryTracker {
    deliveries: DeliveryRepository,
    recipients: RecipientRepository,
}

impl DeliveryTracker {
    /// Create a tracker over the two repositories it coordinates.
    #[must_use]
    pub const fn new(deliveries: DeliveryRepository, recipients: RecipientRepository) -> Self {
        Self {
            deliveries,
            recipients,
        }
    }

    /// Record one delivery event against the record carrying `external_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDeliveryRecord`] if no record matches; the
    /// caller logs and drops such events rather than failing ingestion as
    /// a whole.
    pub async fn record_event(
        &self,
        external_id: &str,
        event: EventType,
        occurred_at: DateTime<Utc>,
    ) -> Result<DeliveryRecord> {
        let record = match self
            .deliveries
            .record_event(external_id, event, occurred_at)
            .await
        {
            Ok(record) => record,
            Err(err @ Error::UnknownDeliveryRecord(_)) => {
                warn!(external_id, event = %event, "event for unknown delivery record");
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        debug!(
            external_id,
            event = %event,
            status = %record.status,
            "delivery event recorded"
        );

        if event.unsubscribes() {
            self.recipients
                .mark_unsubscribed(record.recipient_id, event.as_str(), occurred_at)
                .await?;
        }

        Ok(record)
    }

    /// Verify, parse, and record a raw webhook delivery.
    ///
    /// The signature is checked before the body is trusted at all.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] wrapping `UnauthorizedEvent` on a bad
    /// signature, [`Error::UnknownEventType`] for unrecognized event names,
    /// and [`Error::UnknownDeliveryRecord`] for unmatched external ids.
    pub async fn ingest(
        &self,
        secret: &[u8],
        body: &[u8],
        signature: &str,
    ) -> Result<DeliveryRecord> {
        webhook::verify_signature(secret, body, signature).map_err(Error::Transport)?;
        let payload = webhook::parse_event(body).map_err(Error::Transport)?;

        let event = EventType::parse(&payload.event_type)
            .ok_or_else(|| Error::UnknownEventType(payload.event_type.clone()))?;

        self.record_event(&payload.external_id, event, payload.timestamp)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::campaign::CampaignId;
    use crate::delivery::DeliveryStatus;
    use crate::recipient::Recipient;
    use crate::store::Store;

    async fn seed_submitted(store: &Store, external_id: &str) -> crate::recipient::RecipientId {
        let recipient = store
            .recipients()
            .add(Recipient::new("r@example.com", "R", BTreeMap::new()))
            .await
            .unwrap();
        let recipient_id = recipient.id.unwrap();
        let campaign = CampaignId::new(1);
        store
            .deliveries()
            .create_queued(campaign, recipient_id)
            .await
            .unwrap();
        let record = store
            .deliveries()
            .get_for(campaign, recipient_id)
            .await
            .unwrap()
            .unwrap();
        store
            .deliveries()
            .mark_submitted(record.id, external_id)
            .await
            .unwrap();
        recipient_id
    }

    #[tokio::test]
    async fn bounce_unsubscribes_the_recipient() {
        let store = Store::in_memory().await.unwrap();
        let tracker = store.tracker();
        let recipient_id = seed_submitted(&store, "msg-1").await;

        let record = tracker
            .record_event("msg-1", EventType::Bounced, Utc::now())
            .await
            .unwrap();
        assert_eq!(record.status, DeliveryStatus::Bounced);

        let recipient = store.recipients().get(recipient_id).await.unwrap().unwrap();
        assert!(recipient.unsubscribed);
        assert_eq!(recipient.unsubscribe_reason.as_deref(), Some("bounced"));
    }

    #[tokio::test]
    async fn open_does_not_unsubscribe() {
        let store = Store::in_memory().await.unwrap();
        let tracker = store.tracker();
        let recipient_id = seed_submitted(&store, "msg-1").await;

        tracker
            .record_event("msg-1", EventType::Opened, Utc::now())
            .await
            .unwrap();

        let recipient = store.recipients().get(recipient_id).await.unwrap().unwrap();
        assert!(!recipient.unsubscribed);
    }

    #[tokio::test]
    async fn ingest_verifies_signature_first() {
        let store = Store::in_memory().await.unwrap();
        let tracker = store.tracker();
        seed_submitted(&store, "msg-1").await;

        let secret = b"hook-secret";
        let body = serde_json::to_vec(&serde_json::json!({
            "external_id": "msg-1",
            "type": "delivered",
            "timestamp": Utc::now(),
        }))
        .unwrap();

        // Bad signature: rejected before any state changes.
        let err = tracker.ingest(secret, &body, "AAAA").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(sendledger_transport::Error::UnauthorizedEvent(_))
        ));

        let signature = webhook::sign(secret, &body).unwrap();
        let record = tracker.ingest(secret, &body, &signature).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn ingest_rejects_unknown_event_type() {
        let store = Store::in_memory().await.unwrap();
        let tracker = store.tracker();
        seed_submitted(&store, "msg-1").await;

        let secret = b"hook-secret";
        let body = serde_json::to_vec(&serde_json::json!({
            "external_id": "msg-1",
            "type": "glanced",
            "timestamp": Utc::now(),
        }))
        .unwrap();
        let signature = webhook::sign(secret, &body).unwrap();

        let err = tracker.ingest(secret, &body, &signature).await.unwrap_err();
        assert!(matches!(err, Error::UnknownEventType(name) if name == "glanced"));
    }

    #[tokio::test]
    async fn unknown_record_is_surfaced_not_fatal() {
        let store = Store::in_memory().await.unwrap();
        let tracker = store.tracker();

        let err = tracker
            .record_event("missing", EventType::Opened, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDeliveryRecord(_)));
    }
}
