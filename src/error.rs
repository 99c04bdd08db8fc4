//! Error taxonomy for the LogDot client.
//!
//! Three families of failures flow out of this crate:
//!
//! - transport errors (network, timeout, serialization, cancellation), which
//!   are retried by the transport before being surfaced,
//! - API errors (a well-formed response with a non-success status, or a
//!   success body missing required fields), never retried,
//! - batch-mode precondition violations, synchronous with no network involved.

/// Errors returned by LogDot client operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network-level failure (DNS, connect, TLS, timeout). Retried per the
    /// configured policy before being returned.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The request body could not be serialized to JSON.
    #[error("failed to serialize request body: {0}")]
    Serialize(serde_json::Error),

    /// The response body could not be decoded as JSON.
    #[error("failed to decode response body: {0}")]
    Decode(serde_json::Error),

    /// The caller's cancellation token fired during an in-flight request or a
    /// backoff wait.
    #[error("operation cancelled")]
    Cancelled,

    /// The API answered with a non-success HTTP status.
    #[error("{operation} failed with status {status}")]
    Status {
        /// Which operation was attempted (e.g. "log send").
        operation: &'static str,
        /// The HTTP status code the API returned.
        status: u16,
    },

    /// An entity create/lookup response was missing the entity id.
    #[error("no entity id in response")]
    MissingEntityId,

    /// `send` was called while a batch is open.
    #[error("cannot send individual metrics while in batch mode")]
    BatchModeActive,

    /// `add` was called outside single-metric batch mode.
    #[error("not in single-metric batch mode")]
    NotInSingleBatch,

    /// `add_metric` was called outside multi-metric batch mode.
    #[error("not in multi-metric batch mode")]
    NotInMultiBatch,

    /// Invalid configuration (missing API key, bad base URL, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
