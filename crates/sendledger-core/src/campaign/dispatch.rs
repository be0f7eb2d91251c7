//! Batch dispatch of frozen campaign audiences through a [`Transport`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sendledger_transport::{SendRequest, Transport};

use crate::campaign::{CampaignId, CampaignRepository, CampaignStatus};
use crate::delivery::{DeliveryRepository, QueuedDelivery};
use crate::error::{Error, Result};
use crate::template::{TemplateId, TemplateRepository};

/// Tuning knobs for batch dispatch.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Records submitted per batch.
    pub batch_size: usize,
    /// Pause between batches.
    pub batch_delay: Duration,
    /// Total submission attempts per record, including the first.
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles per attempt.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay: Duration::from_secs(1),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Counters for one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Records handed to the transport.
    pub submitted: u32,
    /// Records that went `failed` after exhausting attempts.
    pub failed: u32,
    /// Whether the campaign reached `Sent`.
    pub completed: bool,
}

/// Drives queued delivery records through the transport in batches.
pub struct Dispatcher {
    campaigns: CampaignRepository,
    deliveries: DeliveryRepository,
    templates: TemplateRepository,
    transport: Arc<dyn Transport>,
    sender: String,
    policy: DispatchPolicy,
}

impl Dispatcher {
    /// Creates a dispatcher sending from `sender` through `transport`.
    #[must_use]
    pub fn new(
        store: &crate::store::Store,
        transport: Arc<dyn Transport>,
        sender: impl Into<String>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            campaigns: store.campaigns(),
            deliveries: store.deliveries(),
            templates: store.templates(),
            transport,
            sender: sender.into(),
            policy,
        }
    }

    /// Runs one campaign to dispatch completion.
    ///
    /// Transitions the campaign to `Sending` (freezing the audience) if it is
    /// still `Scheduled`, then works through queued records in batches. Each
    /// record is submitted with the idempotency key `c{campaign}-r{recipient}`
    /// so a re-run after a crash cannot double-send. One recipient's failure
    /// never aborts the batch. When no queued records remain the campaign
    /// goes `Sent`.
    ///
    /// # Errors
    /// Returns [`Error::CampaignAlreadySent`] or [`Error::InvalidTransition`]
    /// when the campaign is not dispatchable, and a transport error when the
    /// API rejects our credentials (the campaign is marked `Failed` first).
    pub async fn dispatch(&self, id: CampaignId) -> Result<DispatchSummary> {
        let campaign = self.campaigns.begin_sending(id).await?;
        if campaign.status != CampaignStatus::Sending {
            return Err(Error::InvalidTransition {
                from: campaign.status,
                to: CampaignStatus::Sending,
            });
        }

        let subject = campaign.snapshot_subject.unwrap_or_default();
        let body = campaign.snapshot_body.unwrap_or_default();

        let mut summary = DispatchSummary::default();

        loop {
            let queued = self.deliveries.queued_for(id).await?;
            if queued.is_empty() {
                break;
            }

            for record in queued.iter().take(self.policy.batch_size) {
                match self.submit_with_retry(id, record, &subject, &body).await {
                    Ok(receipt) => {
                        if self
                            .deliveries
                            .mark_submitted(record.record_id, &receipt.external_id)
                            .await?
                        {
                            summary.submitted += 1;
                        }
                    }
                    Err(err @ sendledger_transport::Error::Unauthorized(_)) => {
                        tracing::error!(campaign_id = %id, error = %err, "transport rejected credentials");
                        self.campaigns.fail(id).await?;
                        return Err(Error::Transport(err));
                    }
                    Err(err) => {
                        tracing::warn!(
                            campaign_id = %id,
                            recipient_id = %record.recipient_id,
                            error = %err,
                            "delivery failed permanently"
                        );
                        if self
                            .deliveries
                            .mark_failed(record.record_id, &err.to_string())
                            .await?
                        {
                            summary.failed += 1;
                        }
                    }
                }
            }

            // Another writer may have failed the campaign mid-flight.
            let current = self
                .campaigns
                .get(id)
                .await?
                .ok_or(Error::CampaignNotFound(id))?;
            if current.status != CampaignStatus::Sending {
                return Ok(summary);
            }

            if self.deliveries.queued_count(id).await? > 0 {
                tokio::time::sleep(self.policy.batch_delay).await;
            }
        }

        self.campaigns.complete(id).await?;
        summary.completed = true;

        tracing::info!(
            campaign_id = %id,
            submitted = summary.submitted,
            failed = summary.failed,
            "campaign dispatch complete"
        );

        Ok(summary)
    }

    /// Renders a template and submits one message to `address`.
    ///
    /// Creates no delivery records and touches no campaign.
    ///
    /// # Errors
    /// Returns [`Error::TemplateNotFound`] or the transport's error.
    pub async fn send_test(&self, template_id: TemplateId, address: &str) -> Result<()> {
        let template = self
            .templates
            .get(template_id)
            .await?
            .ok_or(Error::TemplateNotFound(template_id))?;

        let key = format!("test-t{}-{}", template_id, Utc::now().timestamp_millis());
        let request = SendRequest::new(
            &self.sender,
            address,
            &template.subject,
            template.content.render_text(),
            key,
        );

        self.transport.submit(&request).await?;
        Ok(())
    }

    async fn submit_with_retry(
        &self,
        campaign_id: CampaignId,
        record: &QueuedDelivery,
        subject: &str,
        body: &str,
    ) -> sendledger_transport::Result<sendledger_transport::SubmissionReceipt> {
        let key = format!("c{}-r{}", campaign_id, record.recipient_id);
        let request = SendRequest::new(&self.sender, &record.email, subject, body, key)
            .to_name(&record.name);

        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.transport.submit(&request).await {
                Ok(receipt) => return Ok(receipt),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    tracing::debug!(
                        recipient = %record.email,
                        attempt,
                        error = %err,
                        "transient transport error, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.policy.max_backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use sendledger_transport::SubmissionReceipt;

    use super::*;
    use crate::campaign::Campaign;
    use crate::delivery::DeliveryStatus;
    use crate::recipient::Recipient;
    use crate::segment::{FilterExpr, Segment};
    use crate::store::Store;
    use crate::template::{Block, BlockKind, ContentTree, Template};

    /// What the mock should do for one submission attempt.
    #[derive(Debug, Clone)]
    enum Reply {
        Accept,
        Transient,
        Permanent,
        Unauthorized,
    }

    struct MockTransport {
        /// Per-call script, consumed front to back; `Accept` once empty.
        script: Mutex<Vec<Reply>>,
        calls: Mutex<Vec<SendRequest>>,
        next_id: AtomicU64,
    }

    impl MockTransport {
        fn scripted(replies: Vec<Reply>) -> Self {
            Self {
                script: Mutex::new(replies),
                calls: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }
        }

        fn accepting() -> Self {
            Self::scripted(Vec::new())
        }

        fn calls(&self) -> Vec<SendRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn submit(
            &self,
            request: &SendRequest,
        ) -> sendledger_transport::Result<SubmissionReceipt> {
            self.calls.lock().unwrap().push(request.clone());
            let reply = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    Reply::Accept
                } else {
                    script.remove(0)
                }
            };
            match reply {
                Reply::Accept => Ok(SubmissionReceipt {
                    external_id: format!("ext-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
                }),
                Reply::Transient => {
                    Err(sendledger_transport::Error::api_error(503, "unavailable"))
                }
                Reply::Permanent => Err(sendledger_transport::Error::InvalidAddress(
                    request.to.clone(),
                )),
                Reply::Unauthorized => {
                    Err(sendledger_transport::Error::Unauthorized("bad key".into()))
                }
            }
        }
    }

    fn fast_policy() -> DispatchPolicy {
        DispatchPolicy {
            batch_size: 10,
            batch_delay: Duration::ZERO,
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    async fn scheduled_campaign(store: &Store, emails: &[&str]) -> CampaignId {
        let mut content = ContentTree::default();
        content.push_root(Block::text_block(BlockKind::Text, "Hi!"));
        let template = store
            .templates()
            .create(Template::new("t", "Subject", content, None))
            .await
            .unwrap();
        let segment = store
            .segments()
            .create(Segment::new("gold", FilterExpr::equals("tier", "gold")))
            .await
            .unwrap();

        for email in emails {
            let attrs = BTreeMap::from([("tier".to_string(), "gold".to_string())]);
            store
                .recipients()
                .add(Recipient::new(*email, *email, attrs))
                .await
                .unwrap();
        }

        let campaign = store
            .campaigns()
            .create(Campaign::new(
                "launch",
                template.id.unwrap(),
                segment.id.unwrap(),
            ))
            .await
            .unwrap();
        let id = campaign.id.unwrap();
        store.campaigns().schedule(id, None).await.unwrap();
        id
    }

    #[tokio::test]
    async fn dispatch_submits_everyone_and_completes() {
        let store = Store::in_memory().await.unwrap();
        let id = scheduled_campaign(&store, &["a@example.com", "b@example.com"]).await;

        let transport = Arc::new(MockTransport::accepting());
        let dispatcher = Dispatcher::new(
            &store,
            transport.clone(),
            "club@example.org",
            fast_policy(),
        );

        let summary = dispatcher.dispatch(id).await.unwrap();
        assert_eq!(summary.submitted, 2);
        assert_eq!(summary.failed, 0);
        assert!(summary.completed);

        let campaign = store.campaigns().get(id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Sent);
        assert!(campaign.sent_at.is_some());

        let records = store.deliveries().list_for_campaign(id).await.unwrap();
        assert!(records.iter().all(|r| r.status == DeliveryStatus::Sent));
        assert!(records.iter().all(|r| r.external_id.is_some()));

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].idempotency_key.starts_with(&format!("c{id}-r")));
    }

    #[tokio::test]
    async fn transient_errors_retry_until_success() {
        let store = Store::in_memory().await.unwrap();
        let id = scheduled_campaign(&store, &["a@example.com"]).await;

        let transport = Arc::new(MockTransport::scripted(vec![
            Reply::Transient,
            Reply::Transient,
            Reply::Accept,
        ]));
        let dispatcher = Dispatcher::new(
            &store,
            transport.clone(),
            "club@example.org",
            fast_policy(),
        );

        let summary = dispatcher.dispatch(id).await.unwrap();
        assert_eq!(summary.submitted, 1);
        assert!(summary.completed);
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn success_on_the_final_allowed_attempt() {
        let store = Store::in_memory().await.unwrap();
        let id = scheduled_campaign(&store, &["a@example.com"]).await;

        // Three transient failures, then acceptance on attempt four of four.
        let transport = Arc::new(MockTransport::scripted(vec![
            Reply::Transient,
            Reply::Transient,
            Reply::Transient,
            Reply::Accept,
        ]));
        let policy = DispatchPolicy {
            max_attempts: 4,
            ..fast_policy()
        };
        let dispatcher =
            Dispatcher::new(&store, transport.clone(), "club@example.org", policy);

        let summary = dispatcher.dispatch(id).await.unwrap();
        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.failed, 0);
        assert!(summary.completed);
        assert_eq!(transport.calls().len(), 4);

        let records = store.deliveries().list_for_campaign(id).await.unwrap();
        assert!(records.iter().all(|r| r.status == DeliveryStatus::Sent));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_record_not_the_campaign() {
        let store = Store::in_memory().await.unwrap();
        let id = scheduled_campaign(&store, &["a@example.com", "b@example.com"]).await;

        // First recipient hits three transient errors, the second succeeds.
        let transport = Arc::new(MockTransport::scripted(vec![
            Reply::Transient,
            Reply::Transient,
            Reply::Transient,
            Reply::Accept,
        ]));
        let dispatcher =
            Dispatcher::new(&store, transport, "club@example.org", fast_policy());

        let summary = dispatcher.dispatch(id).await.unwrap();
        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.completed);

        let campaign = store.campaigns().get(id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Sent);

        let records = store.deliveries().list_for_campaign(id).await.unwrap();
        let failed: Vec<_> = records
            .iter()
            .filter(|r| r.status == DeliveryStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_deref().unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn permanent_error_fails_only_that_recipient() {
        let store = Store::in_memory().await.unwrap();
        let id = scheduled_campaign(&store, &["a@example.com", "b@example.com"]).await;

        let transport = Arc::new(MockTransport::scripted(vec![Reply::Permanent]));
        let dispatcher =
            Dispatcher::new(&store, transport, "club@example.org", fast_policy());

        let summary = dispatcher.dispatch(id).await.unwrap();
        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.completed);
    }

    #[tokio::test]
    async fn unauthorized_fails_the_whole_campaign() {
        let store = Store::in_memory().await.unwrap();
        let id = scheduled_campaign(&store, &["a@example.com"]).await;

        let transport = Arc::new(MockTransport::scripted(vec![Reply::Unauthorized]));
        let dispatcher =
            Dispatcher::new(&store, transport, "club@example.org", fast_policy());

        let err = dispatcher.dispatch(id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(sendledger_transport::Error::Unauthorized(_))
        ));

        let campaign = store.campaigns().get(id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Failed);
    }

    #[tokio::test]
    async fn double_dispatch_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        let id = scheduled_campaign(&store, &["a@example.com"]).await;

        let transport = Arc::new(MockTransport::accepting());
        let dispatcher = Dispatcher::new(
            &store,
            transport.clone(),
            "club@example.org",
            fast_policy(),
        );

        dispatcher.dispatch(id).await.unwrap();
        let err = dispatcher.dispatch(id).await.unwrap_err();
        assert!(matches!(err, Error::CampaignAlreadySent(_)));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn resume_processes_only_queued_records() {
        let store = Store::in_memory().await.unwrap();
        let id = scheduled_campaign(&store, &["a@example.com", "b@example.com"]).await;

        // Freeze the audience and simulate a crash after the first submit.
        store.campaigns().begin_sending(id).await.unwrap();
        let queued = store.deliveries().queued_for(id).await.unwrap();
        store
            .deliveries()
            .mark_submitted(queued[0].record_id, "ext-crashed")
            .await
            .unwrap();

        let transport = Arc::new(MockTransport::accepting());
        let dispatcher = Dispatcher::new(
            &store,
            transport.clone(),
            "club@example.org",
            fast_policy(),
        );

        let summary = dispatcher.dispatch(id).await.unwrap();
        assert_eq!(summary.submitted, 1);
        assert!(summary.completed);

        // Only the still-queued record was resubmitted.
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(transport.calls()[0].to, queued[1].email);
    }

    #[tokio::test]
    async fn send_test_creates_no_records() {
        let store = Store::in_memory().await.unwrap();
        let mut content = ContentTree::default();
        content.push_root(Block::text_block(BlockKind::Text, "Preview"));
        let template = store
            .templates()
            .create(Template::new("t", "Subject", content, None))
            .await
            .unwrap();

        let transport = Arc::new(MockTransport::accepting());
        let dispatcher = Dispatcher::new(
            &store,
            transport.clone(),
            "club@example.org",
            fast_policy(),
        );

        dispatcher
            .send_test(template.id.unwrap(), "me@example.com")
            .await
            .unwrap();

        assert_eq!(transport.calls().len(), 1);
        assert_eq!(transport.calls()[0].to, "me@example.com");

        let err = dispatcher
            .send_test(crate::template::TemplateId(999), "me@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound(_)));
    }
}
