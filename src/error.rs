//! Error types shared across the engine.
//!
//! `CrawlError` covers the full taxonomy the engine deals with: synchronous
//! submission errors, the ignorable download class, queue timeouts for the
//! extra side-channel, recovered callback panics, and setup-time
//! configuration failures.

use thiserror::Error;

/// The error type used throughout the crawl engine.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The bounded request intake is at capacity; the request was not queued.
    #[error("exceeded the maximum number of requests")]
    ExceededMaxRequests,

    /// The bounded item intake is at capacity; the item was not queued.
    #[error("exceeded the maximum number of items")]
    ExceededMaxItems,

    /// The request failed validation before it was accepted.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A callback, errback, or entry name has no registration.
    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    /// A middleware with the same name is already registered.
    #[error("middleware name duplicate: {0}")]
    DuplicateMiddlewareName(String),

    /// A middleware is already registered at this priority.
    #[error("middleware priority duplicate: {0}")]
    DuplicateMiddlewarePriority(i32),

    /// A pipeline with the same name is already registered.
    #[error("pipeline name duplicate: {0}")]
    DuplicatePipelineName(String),

    /// A pipeline is already registered at this priority.
    #[error("pipeline priority duplicate: {0}")]
    DuplicatePipelinePriority(i32),

    /// The ignorable failure class: dropped silently, no errback invocation.
    #[error("ignore request")]
    IgnoreRequest,

    /// No matching extra payload arrived before the deadline.
    #[error("queue timeout")]
    QueueTimeout,

    /// An extra payload arrived under this key but was of another type.
    #[error("extra payload type mismatch for {0}")]
    ExtraMismatch(String),

    /// The governing task context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The transport collaborator failed to produce a response.
    #[error("download failed: {0}")]
    Download(String),

    /// A panic recovered at the work-unit boundary.
    #[error("callback panicked: {message}")]
    CallbackPanic { message: String, backtrace: String },

    /// A callback returned an error.
    #[error("callback failed: {0}")]
    Callback(String),

    /// A pipeline stage returned an error while processing an item.
    #[error("pipeline failed: {0}")]
    Pipeline(String),

    /// Setup-time failure that prevents a task from starting.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The task already reached a terminal state.
    #[error("task stopped: {0}")]
    TaskStopped(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CrawlError {
    /// Whether this error belongs to the ignorable class: dropped silently
    /// with no errback invocation.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, CrawlError::IgnoreRequest)
    }
}
