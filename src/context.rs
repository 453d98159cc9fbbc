//! Task-scoped handle passed to every entry, callback, and errback.
//!
//! A `Context` is a cheap clone carrying the task identity, the governing
//! cancellation token, and the scheduler the handler yields into. Handlers
//! submit follow-up work exclusively through it.

use crate::error::CrawlError;
use crate::pipeline::Item;
use crate::request::Request;
use crate::scheduler::Scheduler;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    task_id: String,
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    /// URL of the response this context was derived from; injected as the
    /// referer of requests yielded from it.
    referer: Option<Url>,
}

impl Context {
    pub(crate) fn new(task_id: String, scheduler: Arc<Scheduler>, cancel: CancellationToken) -> Self {
        Context {
            inner: Arc::new(ContextInner {
                task_id,
                scheduler,
                cancel,
                referer: None,
            }),
        }
    }

    /// Derives the context handed to a response callback.
    pub(crate) fn with_referer(&self, referer: Url) -> Self {
        Context {
            inner: Arc::new(ContextInner {
                task_id: self.inner.task_id.clone(),
                scheduler: Arc::clone(&self.inner.scheduler),
                cancel: self.inner.cancel.clone(),
                referer: Some(referer),
            }),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    /// The task-scoped cancellation signal.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn referer(&self) -> Option<&Url> {
        self.inner.referer.as_ref()
    }

    /// Submits a request for dispatch. Fails synchronously on a full intake,
    /// an unresolvable handler name, or a cancelled context.
    pub async fn yield_request(&self, request: Request) -> Result<(), CrawlError> {
        self.inner.scheduler.yield_request(self, request).await
    }

    /// Submits an extracted item to the pipeline chain.
    pub async fn yield_item(&self, item: Box<dyn Item>) -> Result<(), CrawlError> {
        self.inner.scheduler.yield_item(self, item).await
    }

    /// Publishes a payload on the extra side-channel, non-blocking.
    pub fn yield_extra<T: Any + Send>(&self, payload: T) -> Result<(), CrawlError> {
        self.inner.scheduler.yield_extra(payload)
    }

    /// Retrieves a payload from the extra side-channel, waiting up to the
    /// engine's configured queue timeout.
    pub async fn get_extra<T: Any + Send>(&self) -> Result<T, CrawlError> {
        self.inner.scheduler.get_extra().await
    }

    /// Retrieves a payload from the extra side-channel with an explicit
    /// deadline.
    pub async fn get_extra_within<T: Any + Send>(
        &self,
        timeout: Duration,
    ) -> Result<T, CrawlError> {
        self.inner.scheduler.get_extra_within(timeout).await
    }
}
