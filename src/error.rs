//! The engine's own error taxonomy.
//!
//! Host code gets two kinds of errors back from this crate: a typed
//! [`ErrorKind`] attached to every failed [`LlmResult`](crate::model::LlmResult)
//! (used for retry classification), and an [`EngineError`] returned from
//! fallible port calls that sit outside the request/result lifecycle (storage,
//! construction, agent setup).

use std::fmt;

use crate::prelude::*;

/// Classification of why an LLM call failed.
///
/// Only a subset of these are retryable by default; see
/// [`ErrorKind::is_retryable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Socket/read timeout, or the SSE stream stalled for too long.
    Timeout,
    /// The worker pool's task-level timeout fired before the call returned.
    ThreadTimeout,
    /// HTTP 5xx.
    Server5xx,
    /// HTTP 429, or the response body otherwise indicated a rate limit.
    RateLimit429,
    /// HTTP 413.
    PayloadTooLarge413,
    /// HTTP 422.
    Unprocessable422,
    /// Any other 4xx.
    Client4xx,
    /// The SSE stream produced too many malformed chunks, or a
    /// response-format-constrained parse of the final content failed.
    JsonParse,
    /// A worker task panicked while this request was in flight.
    WorkerException,
    /// The request never produced a result (used only for postcondition
    /// checks; never actually stored).
    Missing,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Is this error kind retryable by the worker pool's default policy?
    ///
    /// `JsonParse` is retryable but tracked against a separate budget
    /// (`max_retries_json_parse`) from transport errors — see
    /// [`crate::worker_pool::WorkerPoolConfig`].
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::ThreadTimeout
                | ErrorKind::Server5xx
                | ErrorKind::RateLimit429
                | ErrorKind::PayloadTooLarge413
                | ErrorKind::Unprocessable422
                | ErrorKind::JsonParse
                | ErrorKind::Unknown
        )
    }

    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorKind::RateLimit429,
            413 => ErrorKind::PayloadTooLarge413,
            422 => ErrorKind::Unprocessable422,
            500..=599 => ErrorKind::Server5xx,
            400..=499 => ErrorKind::Client4xx,
            _ => ErrorKind::Unknown,
        }
    }

    /// The string tag used on the wire and in the `_max_retries_exceeded`
    /// suffix convention.
    pub fn as_tag(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::ThreadTimeout => "thread_timeout",
            ErrorKind::Server5xx => "5xx",
            ErrorKind::RateLimit429 => "429_rate_limit",
            ErrorKind::PayloadTooLarge413 => "413_payload_too_large",
            ErrorKind::Unprocessable422 => "422_unprocessable",
            ErrorKind::Client4xx => "4xx",
            ErrorKind::JsonParse => "json_parse",
            ErrorKind::WorkerException => "worker_exception",
            ErrorKind::Missing => "missing",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_tag())
    }
}

/// Errors raised by engine ports (storage, cost calculation, client
/// construction) outside the normal request/result lifecycle.
///
/// Failures of an individual LLM call never use this type — they're
/// represented as a failed [`LlmResult`](crate::model::LlmResult) instead, so
/// that one bad request never aborts a whole batch.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Failed to build or configure an HTTP client.
    #[error("failed to construct LLM client: {0}")]
    ClientSetup(#[source] anyhow::Error),

    /// A storage port operation failed.
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// The host supplied a request with no messages, or otherwise malformed
    /// input that can't be sent to any model.
    #[error("invalid request {request_id}: {reason}")]
    InvalidRequest {
        /// The offending request's id.
        request_id: String,
        /// Why it was rejected.
        reason: String,
    },
}
