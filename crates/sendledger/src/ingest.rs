//! Inbound webhook listener for transport delivery events.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use tracing::{debug, warn};

use sendledger_core::{DeliveryTracker, Error};

/// Header carrying the base64 HMAC-SHA256 signature of the body.
const SIGNATURE_HEADER: &str = "x-sendledger-signature";

/// Shared state for the event endpoint.
#[derive(Clone)]
pub struct IngestState {
    tracker: DeliveryTracker,
    secret: Arc<[u8]>,
}

impl IngestState {
    /// Creates the listener state from the tracker and the shared secret.
    #[must_use]
    pub fn new(tracker: DeliveryTracker, secret: &str) -> Self {
        Self {
            tracker,
            secret: secret.as_bytes().into(),
        }
    }
}

/// Router exposing `POST /events`.
pub fn router(state: IngestState) -> Router {
    Router::new()
        .route("/events", post(receive_event))
        .with_state(state)
}

/// Verifies, parses, and records one delivery event.
///
/// The transport delivers at-least-once, so acknowledged statuses must be
/// safe to retry: duplicates and out-of-order events are handled by the
/// ledger, and events for records we do not know are acknowledged (and
/// logged) rather than bounced into an endless redelivery loop.
async fn receive_event(
    State(state): State<IngestState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        warn!("event without signature header");
        return StatusCode::UNAUTHORIZED;
    };

    match state.tracker.ingest(&state.secret, &body, signature).await {
        Ok(record) => {
            debug!(record_id = %record.id, status = %record.status, "event ingested");
            StatusCode::OK
        }
        Err(Error::Transport(err @ sendledger_transport::Error::UnauthorizedEvent(_))) => {
            warn!(error = %err, "event failed signature verification");
            StatusCode::UNAUTHORIZED
        }
        Err(Error::Transport(err @ sendledger_transport::Error::Payload(_))) => {
            warn!(error = %err, "malformed event payload");
            StatusCode::BAD_REQUEST
        }
        Err(Error::UnknownEventType(name)) => {
            warn!(event_type = %name, "unrecognized event type");
            StatusCode::BAD_REQUEST
        }
        Err(err @ Error::UnknownDeliveryRecord(_)) => {
            // Ack so the transport stops redelivering; already logged.
            debug!(error = %err, "dropping event for unknown record");
            StatusCode::OK
        }
        Err(err) => {
            warn!(error = %err, "event ingestion failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use serde_json::json;

    use sendledger_core::{CampaignId, DeliveryStatus, Recipient, Store};
    use sendledger_transport::webhook;

    use super::*;

    const SECRET: &str = "listener-secret";

    fn signed(body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let signature = webhook::sign(SECRET.as_bytes(), body).unwrap();
        headers.insert(SIGNATURE_HEADER, signature.parse().unwrap());
        headers
    }

    fn event_body(external_id: &str, event: &str) -> Bytes {
        Bytes::from(
            serde_json::to_vec(&json!({
                "external_id": external_id,
                "type": event,
                "timestamp": Utc::now().to_rfc3339(),
                "metadata": {},
            }))
            .unwrap(),
        )
    }

    async fn state_with_record(external_id: &str) -> (Store, IngestState) {
        let store = Store::in_memory().await.unwrap();
        let recipient = store
            .recipients()
            .add(Recipient::new("r@example.com", "R", BTreeMap::new()))
            .await
            .unwrap();
        let campaign = CampaignId::new(1);
        store
            .deliveries()
            .create_queued(campaign, recipient.id.unwrap())
            .await
            .unwrap();
        let record = store
            .deliveries()
            .get_for(campaign, recipient.id.unwrap())
            .await
            .unwrap()
            .unwrap();
        store
            .deliveries()
            .mark_submitted(record.id, external_id)
            .await
            .unwrap();
        let state = IngestState::new(store.tracker(), SECRET);
        (store, state)
    }

    #[tokio::test]
    async fn valid_event_updates_the_ledger() {
        let (store, state) = state_with_record("msg-1").await;

        let body = event_body("msg-1", "delivered");
        let status = receive_event(State(state), signed(&body), body).await;
        assert_eq!(status, StatusCode::OK);

        let record = store
            .deliveries()
            .get_by_external_id("msg-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn missing_or_bad_signature_is_unauthorized() {
        let (_store, state) = state_with_record("msg-1").await;
        let body = event_body("msg-1", "delivered");

        let status =
            receive_event(State(state.clone()), HeaderMap::new(), body.clone()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut tampered = body.to_vec();
        tampered[0] ^= 1;
        let status = receive_event(State(state), signed(&body), Bytes::from(tampered)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_record_is_acknowledged() {
        let (_store, state) = state_with_record("msg-1").await;

        let body = event_body("msg-unknown", "delivered");
        let status = receive_event(State(state), signed(&body), body).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_event_type_is_rejected() {
        let (_store, state) = state_with_record("msg-1").await;

        let body = event_body("msg-1", "glanced");
        let status = receive_event(State(state), signed(&body), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bounce_event_unsubscribes_the_recipient() {
        let (store, state) = state_with_record("msg-1").await;

        let body = event_body("msg-1", "bounced");
        let status = receive_event(State(state), signed(&body), body).await;
        assert_eq!(status, StatusCode::OK);

        let recipient = store
            .recipients()
            .get_by_email("r@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(recipient.unsubscribed);
    }
}
