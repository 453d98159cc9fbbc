//! # Crawler Module
//!
//! The engine facade: owns the registries shared by every task and spawns
//! task controllers.
//!
//! ## Overview
//!
//! A `Crawler` is built once through the
//! [`CrawlerBuilder`](crate::builder::CrawlerBuilder) and holds the handler
//! tables, middleware chain, pipeline chain, downloader, duplicate filter,
//! and statistics. Each [`Task`] it spawns gets a fresh scheduler, a fresh
//! request/item counter pair combined into a
//! [`MultiState`](crate::state::MultiState), and its own cancellation
//! signal.

use crate::builder::{CrawlerBuilder, CrawlerConfig};
use crate::downloader::Downloader;
use crate::error::CrawlError;
use crate::filter::Filter;
use crate::handler::HandlerRegistry;
use crate::middleware::MiddlewareSet;
use crate::pipeline::PipelineSet;
use crate::scheduler::{Scheduler, SchedulerParts};
use crate::state::{MultiState, StateCounter};
use crate::stats::StatCollector;
use crate::task::{Job, Task, TaskStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct Crawler {
    config: CrawlerConfig,
    handlers: Arc<HandlerRegistry>,
    middlewares: Arc<MiddlewareSet>,
    pipelines: Arc<PipelineSet>,
    downloader: Arc<dyn Downloader>,
    filter: Arc<Filter>,
    stats: Arc<StatCollector>,
    next_task_id: AtomicU64,
}

impl Crawler {
    pub fn builder() -> CrawlerBuilder {
        CrawlerBuilder::new()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: CrawlerConfig,
        handlers: Arc<HandlerRegistry>,
        middlewares: Arc<MiddlewareSet>,
        pipelines: Arc<PipelineSet>,
        downloader: Arc<dyn Downloader>,
        filter: Arc<Filter>,
        stats: Arc<StatCollector>,
    ) -> Self {
        Crawler {
            config,
            handlers,
            middlewares,
            pipelines,
            downloader,
            filter,
            stats,
            next_task_id: AtomicU64::new(0),
        }
    }

    /// Creates a task for the given job. The task is `Pending` until
    /// [`Task::start`] is called.
    pub fn task(&self, job: Job) -> Arc<Task> {
        let id = format!("task-{}", self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1);
        debug!(task = %id, entry = %job.entry, "creating task");

        let request_state = StateCounter::new();
        let item_state = StateCounter::new();
        let multi = MultiState::compose(vec![
            Arc::clone(&request_state),
            Arc::clone(&item_state),
        ]);
        let cancel = CancellationToken::new();

        let scheduler = Scheduler::new(SchedulerParts {
            handlers: Arc::clone(&self.handlers),
            downloader: Arc::clone(&self.downloader),
            middlewares: Arc::clone(&self.middlewares),
            pipelines: Arc::clone(&self.pipelines),
            filter: Arc::clone(&self.filter),
            stats: Arc::clone(&self.stats),
            request_state,
            item_state,
            cancel: cancel.clone(),
            max_requests: self.config.max_requests,
            pipeline_concurrency: self.config.pipeline_concurrency,
            default_interval: self.config.default_interval,
            queue_timeout: self.config.queue_timeout,
        });

        Task::create(id, job, scheduler, cancel, multi)
    }

    /// Runs one job to completion: spawns the task, starts it, and waits for
    /// its terminal status.
    pub async fn run(
        &self,
        entry: &str,
        args: serde_json::Value,
    ) -> Result<(TaskStatus, Arc<Task>), CrawlError> {
        let task = self.task(Job::new(entry).with_args(args));
        task.start()?;
        let status = task.wait().await;
        Ok((status, task))
    }

    /// The statistics shared by every task of this crawler.
    pub fn stats(&self) -> Arc<StatCollector> {
        Arc::clone(&self.stats)
    }

    /// The duplicate filter shared by every task of this crawler.
    pub fn filter(&self) -> Arc<Filter> {
        Arc::clone(&self.filter)
    }
}
