//! Outbound transport trait and HTTP implementation.

use std::fmt;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::{SendRequest, SubmissionReceipt};

/// Boundary to the outbound mail delivery service.
///
/// Implementations must honor the request's idempotency key: submitting the
/// same key twice produces at most one message.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submits one message for delivery.
    async fn submit(&self, request: &SendRequest) -> Result<SubmissionReceipt>;
}

/// HTTP client for a hosted mail delivery API.
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Successful submission response body.
#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

impl HttpTransport {
    /// Creates a transport for the given API endpoint and key.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client
    /// cannot be constructed.
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|err| Error::Config(format!("base URL: {err}")))?;
        let http = Client::builder()
            .user_agent(concat!("sendledger/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self) -> Result<Url> {
        self.base_url
            .join("v1/messages")
            .map_err(|err| Error::Config(format!("base URL: {err}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(&self, request: &SendRequest) -> Result<SubmissionReceipt> {
        let endpoint = self.endpoint()?;

        let response = self
            .http
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: SubmitResponse = response
                .json()
                .await
                .map_err(|err| Error::InvalidResponse(err.to_string()))?;
            debug!(external_id = %body.id, to = %request.to, "message accepted");
            return Ok(SubmissionReceipt {
                external_id: body.id,
            });
        }

        let message = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), to = %request.to, "submission rejected");
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Unauthorized(message)),
            StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => {
                Err(Error::InvalidAddress(message))
            }
            _ => Err(Error::api_error(status.as_u16(), message)),
        }
    }
}
