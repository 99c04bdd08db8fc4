//! Authenticated JSON HTTP transport with bounded retry.
//!
//! One logical request = up to `max_attempts` network attempts. Any HTTP
//! response, success or not, ends the retry loop immediately; only
//! transport-level failures (connect errors, timeouts, body serialization)
//! are retried. Between attempts the transport sleeps with exponential
//! backoff plus jitter, racing the caller's cancellation token.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// HTTP statuses the API uses for successful writes.
pub(crate) fn is_success(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::CREATED
}

/// Shared HTTP transport. Holds no batch state, so one instance is safely
/// shared read-only between a client and everything derived from it.
#[derive(Debug)]
pub(crate) struct Transport {
    client: Client,
    headers: HeaderMap,
    retry: RetryConfig,
    debug: bool,
    cancel: CancellationToken,
}

impl Transport {
    pub(crate) fn new(
        api_key: &str,
        timeout: Duration,
        retry: RetryConfig,
        debug: bool,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
            Error::InvalidConfig("API key contains invalid header characters".to_string())
        })?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            headers,
            retry,
            debug,
            cancel,
        })
    }

    /// POSTs a JSON body. Returns the final HTTP status and raw response
    /// bytes; interpreting the status is the caller's job.
    pub(crate) async fn post<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<(StatusCode, Vec<u8>)> {
        self.send_with_retry(Method::POST, url, Some(body)).await
    }

    /// Issues a body-less GET request.
    pub(crate) async fn get(&self, url: &str) -> Result<(StatusCode, Vec<u8>)> {
        self.send_with_retry::<()>(Method::GET, url, None).await
    }

    async fn send_with_retry<T: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&T>,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let mut attempt = 0;
        loop {
            match self.attempt(method.clone(), url, body).await {
                Ok(outcome) => return Ok(outcome),
                // Cancellation is a caller decision, never a retry trigger.
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(err);
                    }
                    let delay = backoff_delay(&self.retry, attempt - 1);
                    if self.debug {
                        debug!(
                            attempt,
                            max_attempts = self.retry.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying request"
                        );
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
            }
        }
    }

    async fn attempt<T: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&T>,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let mut builder = self
            .client
            .request(method.clone(), url)
            .headers(self.headers.clone());

        if let Some(body) = body {
            let payload = serde_json::to_vec(body).map_err(Error::Serialize)?;
            if self.debug {
                debug!(
                    method = %method,
                    url,
                    payload = %String::from_utf8_lossy(&payload),
                    "logdot request"
                );
            }
            builder = builder.body(payload);
        } else if self.debug {
            debug!(method = %method, url, "logdot request");
        }

        let response = tokio::select! {
            result = builder.send() => result?,
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        };

        let status = response.status();
        let body = tokio::select! {
            result = response.bytes() => result?.to_vec(),
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        };

        if self.debug {
            debug!(
                status = status.as_u16(),
                body = %String::from_utf8_lossy(&body),
                "logdot response"
            );
        }

        Ok((status, body))
    }
}

/// Delay before retry number `attempt` (zero-based):
/// `min(max_delay, base_delay * 2^attempt * (1 + jitter))` with jitter
/// uniform in [0, 0.3).
pub(crate) fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    // Cap the exponent so powi cannot overflow to infinity for absurd
    // attempt counts; max_delay clamps long before this matters.
    let exp = retry.base_delay.as_secs_f64() * 2f64.powi(attempt.min(32) as i32);
    let jitter = fastrand::f64() * 0.3;
    Duration::from_secs_f64(exp * (1.0 + jitter)).min(retry.max_delay)
}
