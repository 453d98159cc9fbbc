//! # Scheduler Module
//!
//! The dispatcher: consumes submitted requests from a bounded intake,
//! applies per-slot throttling, and launches isolated fetch-and-callback
//! work units.
//!
//! ## Overview
//!
//! Submissions enter through [`Scheduler::yield_request`], which validates
//! the request, resolves its handler names against the registry, and fails
//! fast with an "exceeded maximum" error when the intake is at capacity.
//! Accepted requests are picked up by the dispatch loop, which spawns one
//! work unit per request: the unit waits for its slot's token (racing the
//! task's cancellation signal), performs the Download through the middleware
//! chain, builds the response, and invokes the resolved callback.
//!
//! ## Isolation
//!
//! Each work unit is recovered at its boundary: a panic inside a callback is
//! converted into an error carrying the panic message and a captured
//! backtrace, routed to the request's errback, and the dispatcher keeps
//! processing subsequent requests. The request counter is decremented
//! exactly once per accepted request regardless of outcome.
//!
//! Items yielded by callbacks flow through a second bounded intake into the
//! pipeline chain, processed by a pool capped at the configured pipeline
//! concurrency.

pub mod extra;
pub mod slot;

use crate::context::Context;
use crate::downloader::Downloader;
use crate::error::CrawlError;
use crate::filter::Filter;
use crate::handler::HandlerRegistry;
use crate::middleware::MiddlewareSet;
use crate::pipeline::{Item, ItemOutcome, PipelineSet};
use crate::request::Request;
use crate::response::Response;
use crate::state::StateCounter;
use crate::stats::StatCollector;
use extra::ExtraExchange;
use futures_util::FutureExt;
use kanal::{AsyncReceiver, AsyncSender, bounded_async};
use parking_lot::Mutex;
use slot::SlotRegistry;
use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

struct Submission {
    ctx: Context,
    request: Request,
}

/// Everything a scheduler is wired with at construction.
pub(crate) struct SchedulerParts {
    pub handlers: Arc<HandlerRegistry>,
    pub downloader: Arc<dyn Downloader>,
    pub middlewares: Arc<MiddlewareSet>,
    pub pipelines: Arc<PipelineSet>,
    pub filter: Arc<Filter>,
    pub stats: Arc<StatCollector>,
    pub request_state: Arc<StateCounter>,
    pub item_state: Arc<StateCounter>,
    pub cancel: CancellationToken,
    pub max_requests: usize,
    pub pipeline_concurrency: usize,
    pub default_interval: Option<Duration>,
    pub queue_timeout: Duration,
}

/// One task's dispatcher.
pub struct Scheduler {
    max_requests: usize,
    queue_timeout: Duration,
    request_tx: AsyncSender<Submission>,
    request_rx: Mutex<Option<AsyncReceiver<Submission>>>,
    item_tx: AsyncSender<Box<dyn Item>>,
    item_rx: Mutex<Option<AsyncReceiver<Box<dyn Item>>>>,
    slots: SlotRegistry,
    extras: ExtraExchange,
    handlers: Arc<HandlerRegistry>,
    downloader: Arc<dyn Downloader>,
    middlewares: Arc<MiddlewareSet>,
    pipelines: Arc<PipelineSet>,
    filter: Arc<Filter>,
    request_state: Arc<StateCounter>,
    item_state: Arc<StateCounter>,
    stats: Arc<StatCollector>,
    cancel: CancellationToken,
    pipeline_concurrency: usize,
    started: AtomicBool,
}

impl Scheduler {
    pub(crate) fn new(parts: SchedulerParts) -> Arc<Self> {
        let (request_tx, request_rx) = bounded_async(parts.max_requests);
        let (item_tx, item_rx) = bounded_async(parts.max_requests);
        Arc::new(Scheduler {
            max_requests: parts.max_requests,
            queue_timeout: parts.queue_timeout,
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
            item_tx,
            item_rx: Mutex::new(Some(item_rx)),
            slots: SlotRegistry::new(parts.default_interval),
            extras: ExtraExchange::new(parts.max_requests),
            handlers: parts.handlers,
            downloader: parts.downloader,
            middlewares: parts.middlewares,
            pipelines: parts.pipelines,
            filter: parts.filter,
            request_state: parts.request_state,
            item_state: parts.item_state,
            stats: parts.stats,
            cancel: parts.cancel,
            pipeline_concurrency: parts.pipeline_concurrency,
            started: AtomicBool::new(false),
        })
    }

    /// Starts the dispatch and item-processing loops. Idempotent.
    pub(crate) fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(rx) = self.request_rx.lock().take() {
            let scheduler = Arc::clone(self);
            tokio::spawn(scheduler.run_requests(rx));
        }
        if let Some(rx) = self.item_rx.lock().take() {
            let scheduler = Arc::clone(self);
            tokio::spawn(scheduler.run_items(rx));
        }
    }

    /// Winds the scheduler down: interrupts blocking waits and closes every
    /// pipeline. In-flight work that already started is not terminated.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        self.pipelines.close().await;
    }

    pub(crate) fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub(crate) fn request_state(&self) -> &Arc<StateCounter> {
        &self.request_state
    }

    pub(crate) fn item_state(&self) -> &Arc<StateCounter> {
        &self.item_state
    }

    /// Enqueues a request for dispatch.
    ///
    /// Fails synchronously when the intake is at capacity, when the context
    /// is cancelled, or when a referenced handler name has no registration.
    /// On acceptance the request counter is entered; the dispatcher leaves
    /// it exactly once whatever the outcome.
    pub(crate) async fn yield_request(
        &self,
        ctx: &Context,
        mut request: Request,
    ) -> Result<(), CrawlError> {
        if ctx.is_cancelled() || self.cancel.is_cancelled() {
            return Err(CrawlError::Cancelled);
        }
        let Some(callback) = &request.callback else {
            return Err(CrawlError::InvalidRequest("request has no callback".into()));
        };
        if !self.handlers.has_callback(callback) {
            return Err(CrawlError::UnknownHandler(callback.clone()));
        }
        if let Some(errback) = &request.errback {
            if !self.handlers.has_errback(errback) {
                return Err(CrawlError::UnknownHandler(errback.clone()));
            }
        }
        // In-flight covers accepted-but-unfinished requests plus parked
        // extras; the bounded channel can never hold more than that.
        if self.request_state.count() >= self.max_requests {
            warn!(url = %request.url, "request intake full, submission rejected");
            return Err(CrawlError::ExceededMaxRequests);
        }

        if request.referer.is_none() {
            if let Some(referer) = ctx.referer() {
                request.referer = Some(referer.to_string());
            }
        }

        trace!(url = %request.url, slot = request.slot_or_default(), "request enqueued");
        self.request_state.enter();
        let submission = Submission {
            ctx: ctx.clone(),
            request,
        };
        if self.request_tx.send(submission).await.is_err() {
            self.request_state.leave();
            return Err(CrawlError::TaskStopped("request intake closed".into()));
        }
        self.stats.increment_requests_enqueued();
        Ok(())
    }

    /// Enqueues an extracted item for the pipeline chain.
    pub(crate) async fn yield_item(
        &self,
        ctx: &Context,
        item: Box<dyn Item>,
    ) -> Result<(), CrawlError> {
        if ctx.is_cancelled() || self.cancel.is_cancelled() {
            return Err(CrawlError::Cancelled);
        }
        if self.item_state.count() >= self.max_requests {
            warn!("item intake full, submission rejected");
            return Err(CrawlError::ExceededMaxItems);
        }
        self.item_state.enter();
        if self.item_tx.send(item).await.is_err() {
            self.item_state.leave();
            return Err(CrawlError::TaskStopped("item intake closed".into()));
        }
        Ok(())
    }

    /// Publishes a payload on the extra side-channel. The request counter is
    /// entered so the task cannot finalize while the payload is parked.
    pub(crate) fn yield_extra<T: Any + Send>(&self, payload: T) -> Result<(), CrawlError> {
        self.request_state.enter();
        match self.extras.publish(payload) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.request_state.leave();
                Err(e)
            }
        }
    }

    /// Retrieves a payload from the extra side-channel with the configured
    /// queue timeout.
    pub(crate) async fn get_extra<T: Any + Send>(&self) -> Result<T, CrawlError> {
        self.get_extra_within(self.queue_timeout).await
    }

    /// Retrieves a payload from the extra side-channel. Leaves the request
    /// counter on completion, matching the enter from the publish side.
    pub(crate) async fn get_extra_within<T: Any + Send>(
        &self,
        timeout: Duration,
    ) -> Result<T, CrawlError> {
        let result = self.extras.retrieve(timeout).await;
        self.request_state.leave();
        result
    }

    async fn run_requests(self: Arc<Self>, rx: AsyncReceiver<Submission>) {
        trace!("request dispatch loop started");
        let mut units = JoinSet::new();
        loop {
            let submission = tokio::select! {
                received = rx.recv() => match received {
                    Ok(submission) => submission,
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => break,
            };
            let scheduler = Arc::clone(&self);
            units.spawn(scheduler.run_unit(submission));
            while units.try_join_next().is_some() {}
        }

        // Submissions still queued at shutdown must drain their counter.
        while let Ok(Some(_submission)) = rx.try_recv() {
            self.stats.increment_requests_cancelled();
            self.request_state.leave();
        }
        while units.join_next().await.is_some() {}
        trace!("request dispatch loop finished");
    }

    /// One isolated work unit. The request counter is left exactly once, on
    /// exit, whatever the outcome. Callback panics are recovered inside
    /// `process_unit` where the response is still at hand; this outer guard
    /// recovers panics from any other stage of the unit.
    async fn run_unit(self: Arc<Self>, submission: Submission) {
        let Submission { ctx, request } = submission;
        let errback = request.errback.clone();
        let unit = self.process_unit(ctx.clone(), request);
        if let Err(panic) = AssertUnwindSafe(unit).catch_unwind().await {
            let message = panic_message(panic.as_ref());
            let backtrace = Backtrace::force_capture().to_string();
            self.handle_error(
                &ctx,
                None,
                CrawlError::CallbackPanic { message, backtrace },
                errback.as_deref(),
            );
        }
        self.request_state.leave();
    }

    async fn process_unit(&self, ctx: Context, request: Request) {
        if request.skip {
            debug!(url = %request.url, "request marked skip, discarded");
            self.stats.increment_requests_skipped();
            return;
        }

        if !request.skip_filter {
            if let Some(key) = &request.unique_key {
                if self.filter.exists_or_store(key) {
                    debug!(url = %request.url, key = %key, "duplicate request ignored");
                    self.stats.increment_requests_ignored();
                    return;
                }
            }
        }

        let limiter = self.slots.load_or_store(&request);
        let permit = match limiter.acquire(ctx.cancellation()).await {
            Ok(permit) => permit,
            Err(_) => {
                debug!(url = %request.url, slot = limiter.name(), "cancelled while waiting for slot token");
                self.stats.increment_requests_cancelled();
                return;
            }
        };

        self.stats.increment_requests_sent();
        let errback = request.errback.clone();

        let outbound = match self.middlewares.process_request(request).await {
            Ok(request) => request,
            Err(e) => {
                self.handle_error(&ctx, None, e, errback.as_deref());
                return;
            }
        };

        let response = match self.downloader.download(&outbound).await {
            Ok(response) => response,
            Err(e) => {
                self.handle_error(&ctx, None, e, errback.as_deref());
                return;
            }
        };
        self.stats.record_response_status(response.status().as_u16());

        let response = match self.middlewares.process_response(response).await {
            Ok(response) => response,
            Err(e) => {
                self.handle_error(&ctx, None, e, errback.as_deref());
                return;
            }
        };

        // The fetch is complete; release the slot before the callback runs.
        drop(permit);

        let callback = match response.request().callback.as_deref() {
            Some(name) => match self.handlers.callback(name) {
                Ok(callback) => callback,
                Err(e) => {
                    self.handle_error(&ctx, Some(response), e, errback.as_deref());
                    return;
                }
            },
            None => {
                self.stats.increment_requests_succeeded();
                return;
            }
        };

        let cb_ctx = ctx.with_referer(response.url().clone());
        let response_for_errback = errback.as_ref().map(|_| response.clone());
        let url = response.url().clone();

        match AssertUnwindSafe(callback(cb_ctx, response)).catch_unwind().await {
            Ok(Ok(())) => {
                trace!(%url, "callback completed");
                self.stats.increment_requests_succeeded();
            }
            Ok(Err(e)) => {
                self.handle_error(&ctx, response_for_errback, e, errback.as_deref());
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                let backtrace = Backtrace::force_capture().to_string();
                error!(%url, "callback panicked: {message}");
                self.handle_error(
                    &ctx,
                    response_for_errback,
                    CrawlError::CallbackPanic { message, backtrace },
                    errback.as_deref(),
                );
            }
        }
    }

    /// Routes a failed unit: ignorable errors are dropped silently, all
    /// others are logged, counted, and delivered to the errback when one is
    /// registered.
    fn handle_error(
        &self,
        ctx: &Context,
        response: Option<Response>,
        err: CrawlError,
        errback: Option<&str>,
    ) {
        if err.is_ignorable() {
            debug!(task = ctx.task_id(), "request ignored: {err}");
            self.stats.increment_requests_ignored();
            return;
        }

        error!(task = ctx.task_id(), "request failed: {err}");
        self.stats.increment_requests_failed();
        if let Some(name) = errback {
            if let Ok(errback) = self.handlers.errback(name) {
                errback(ctx.clone(), response, err);
            }
        }
    }

    async fn run_items(self: Arc<Self>, rx: AsyncReceiver<Box<dyn Item>>) {
        trace!(
            concurrency = self.pipeline_concurrency,
            "item processor started"
        );
        let semaphore = Arc::new(Semaphore::new(self.pipeline_concurrency));
        let mut tasks = JoinSet::new();
        loop {
            let item = tokio::select! {
                received = rx.recv() => match received {
                    Ok(item) => item,
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => break,
            };
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let scheduler = Arc::clone(&self);
            tasks.spawn(async move {
                let chain = scheduler.pipelines.process(item);
                match AssertUnwindSafe(chain).catch_unwind().await {
                    Ok(ItemOutcome::Success) => scheduler.stats.increment_item_success(),
                    Ok(ItemOutcome::Ignored) => scheduler.stats.increment_item_ignore(),
                    Ok(ItemOutcome::Error) => scheduler.stats.increment_item_error(),
                    Err(panic) => {
                        error!("pipeline panicked: {}", panic_message(panic.as_ref()));
                        scheduler.stats.increment_item_error();
                    }
                }
                scheduler.item_state.leave();
                drop(permit);
            });
            while tasks.try_join_next().is_some() {}
        }

        // Items still queued at shutdown must drain their counter.
        while let Ok(Some(_item)) = rx.try_recv() {
            self.stats.increment_item_ignore();
            self.item_state.leave();
        }
        while tasks.join_next().await.is_some() {}
        trace!("item processor finished");
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic of unknown type".to_string()
    }
}
