//! Contract over the remote batch-oriented model API: submit one request as
//! a batch, poll the batch, fetch per-request results. Everything else the
//! remote API offers is out of scope.

pub mod http;

pub use http::HttpBatchApi;

use model::batch::{BatchCreated, BatchInfo, BatchResultItem};

/// Error of a remote API interaction. `retryable` decides whether the
/// dispatcher may re-enqueue the task or must fail it; it is classified from
/// the error message at the client boundary.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    pub message: String,
    pub retryable: bool,
}

impl Error {
    /// Classifies retryability from the message.
    pub fn classified(message: impl Into<String>) -> Self {
        let message = message.into();
        let retryable = should_retry(&message);
        Self { message, retryable }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Message patterns of transient conditions worth another attempt.
const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "connection",
    "network",
    "rate limit",
    "too many requests",
    "429",
    "overloaded",
    "529",
];

/// Message patterns of input or request problems a retry cannot fix.
const PERMANENT_PATTERNS: &[&str] = &[
    "invalid",
    "content policy",
    "malformed",
    "400",
    "format",
    "invalid_request_error",
];

/// Decides whether an error message describes a condition worth retrying.
/// Transient patterns win over permanent ones; unrecognized errors are
/// retried.
pub fn should_retry(message: &str) -> bool {
    let message = message.to_lowercase();
    if RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
    {
        return true;
    }
    if PERMANENT_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
    {
        return false;
    }
    true
}

/// The batch lifecycle operations the service depends on.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait::async_trait]
pub trait BatchApi: Send + Sync + 'static {
    /// Submits a single-request batch; `custom_id` keys the request's entry
    /// in the result stream.
    async fn create_batch(&self, custom_id: &str, prompt: &str) -> Result<BatchCreated>;

    async fn batch_status(&self, batch_id: &str) -> Result<BatchInfo>;

    /// All per-request results of an ended batch, decoded in one pass. The
    /// remote stream is not restartable, so callers index the returned
    /// entries instead of re-fetching.
    async fn batch_results(&self, batch_id: &str) -> Result<Vec<BatchResultItem>>;
}
