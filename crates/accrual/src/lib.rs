//! Client for the external accrual calculator.
//!
//! [`AccrualClient`] is the only wire boundary of the loyalty core: anything
//! that can answer "what is the status of order N" with an [`AccrualReport`]
//! can stand in for the real provider. [`HttpAccrualClient`] speaks the
//! provider's REST API.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Status of an order as reported by the accrual provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    Registered,
    Processing,
    Processed,
    Invalid,
}

impl fmt::Display for AccrualStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccrualStatus::Registered => "REGISTERED",
            AccrualStatus::Processing => "PROCESSING",
            AccrualStatus::Processed => "PROCESSED",
            AccrualStatus::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

/// The provider's answer for one order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccrualReport {
    pub order: String,
    pub status: AccrualStatus,
    /// Points awarded; only meaningful for [`AccrualStatus::Processed`].
    #[serde(default)]
    pub accrual: Option<u64>,
}

/// Errors returned by an [`AccrualClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccrualError {
    /// Network failure, timeout or an unexpected HTTP status.
    #[error("accrual service unavailable: {0}")]
    Unavailable(String),
    /// The provider asked us to back off.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    /// The provider does not know the order (yet).
    #[error("order is not registered in the accrual system")]
    NotRegistered,
    /// The response body could not be decoded.
    #[error("malformed accrual response: {0}")]
    Malformed(String),
}

/// Queries the accrual provider for a single order.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait AccrualClient: Send + Sync {
    async fn query(&self, number: &str) -> Result<AccrualReport, AccrualError>;
}

/// [`AccrualClient`] over the provider's HTTP API (`GET /api/orders/{number}`).
pub struct HttpAccrualClient {
    client: Client,
    base_url: String,
    default_retry_after: Duration,
}

impl HttpAccrualClient {
    /// Create a client for the provider at `base_url`.
    ///
    /// # Arguments
    /// * `base_url` - e.g. `http://localhost:8081`; a trailing slash is ignored
    /// * `timeout` - upper bound for a whole request, body included
    /// * `default_retry_after` - back-off used when a 429 carries no usable `Retry-After`
    pub fn new(
        base_url: &str,
        timeout: Duration,
        default_retry_after: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_retry_after,
        })
    }

    fn retry_after(&self, response: &reqwest::Response) -> Duration {
        response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.default_retry_after)
    }
}

#[async_trait]
impl AccrualClient for HttpAccrualClient {
    async fn query(&self, number: &str) -> Result<AccrualReport, AccrualError> {
        let url = format!("{}/api/orders/{}", self.base_url, number);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AccrualError::Unavailable(e.to_string()))?;

        let status = response.status();
        debug!(order = number, %status, "Accrual service responded");
        match status {
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| AccrualError::Unavailable(e.to_string()))?;
                let report: AccrualReport = serde_json::from_slice(&body)
                    .map_err(|e| AccrualError::Malformed(e.to_string()))?;
                if report.order != number {
                    return Err(AccrualError::Malformed(format!(
                        "asked for order {number}, got {}",
                        report.order
                    )));
                }
                Ok(report)
            }
            StatusCode::NO_CONTENT => Err(AccrualError::NotRegistered),
            StatusCode::TOO_MANY_REQUESTS => Err(AccrualError::RateLimited {
                retry_after: self.retry_after(&response),
            }),
            other => Err(AccrualError::Unavailable(format!("HTTP {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(AccrualStatus::Registered.to_string(), "REGISTERED");
        assert_eq!(AccrualStatus::Processed.to_string(), "PROCESSED");
    }

    #[test]
    fn test_error_display() {
        let err = AccrualError::RateLimited {
            retry_after: Duration::from_secs(60),
        };
        assert_eq!(err.to_string(), "rate limited, retry after 60s");
    }
}
