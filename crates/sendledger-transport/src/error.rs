//! Error types for transport operations.

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Transport error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP request failed before a response was received.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The mail API returned an error response.
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code (e.g., 429).
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// API credentials were rejected.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Recipient address is not acceptable.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The API response could not be interpreted.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Inbound event failed signature verification.
    #[error("Unauthorized event: {0}")]
    UnauthorizedEvent(String),

    /// Inbound event payload could not be parsed.
    #[error("Malformed event payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// Client configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Creates an API error from a status code and message.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Returns true if the operation may succeed if retried.
    ///
    /// Covers rate limiting (429), request timeout (408), server errors
    /// (5xx), and connection-level failures.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status, .. } => {
                *status == 408 || *status == 429 || (*status >= 500 && *status < 600)
            }
            Self::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }

    /// Returns true if retrying cannot help.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_transient() {
        assert!(Error::api_error(429, "slow down").is_transient());
        assert!(Error::api_error(503, "unavailable").is_transient());
        assert!(Error::api_error(408, "timeout").is_transient());
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(Error::api_error(400, "bad request").is_permanent());
        assert!(Error::api_error(422, "unprocessable").is_permanent());
        assert!(Error::Unauthorized("bad key".into()).is_permanent());
        assert!(Error::InvalidAddress("not-an-email".into()).is_permanent());
    }
}
