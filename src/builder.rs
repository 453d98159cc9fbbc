//! # Builder Module
//!
//! Provides the `CrawlerBuilder`, a fluent API for constructing and
//! configuring [`Crawler`] instances.
//!
//! ## Overview
//!
//! The builder assembles the handler tables, middleware chain, pipeline
//! chain, downloader, and configuration into a `Crawler`. All registrations
//! are validated at `build()` time: duplicate middleware/pipeline names or
//! priorities and zero-valued limits are rejected before any task can run,
//! and a default console pipeline is installed when none is registered.
//!
//! ## Example
//!
//! ```rust,ignore
//! use trawler_core::prelude::*;
//!
//! let crawler = Crawler::builder()
//!     .max_requests(500)
//!     .register_entry("list", |ctx, _args| async move {
//!         ctx.yield_request(
//!             Request::parse("https://example.com/list")?.with_callback("parse"),
//!         )
//!         .await
//!     })
//!     .register_callback("parse", |_ctx, response| async move {
//!         println!("{}", response.text());
//!         Ok(())
//!     })
//!     .build()?;
//! ```

use crate::context::Context;
use crate::crawler::Crawler;
use crate::downloader::{Downloader, HttpDownloader};
use crate::error::CrawlError;
use crate::filter::Filter;
use crate::handler::HandlerRegistry;
use crate::middleware::{Middleware, MiddlewareSet};
use crate::pipeline::{ConsoleLogPipeline, Pipeline, PipelineSet};
use crate::response::Response;
use crate::stats::StatCollector;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Configuration for the engine's scheduling limits.
pub struct CrawlerConfig {
    /// Maximum in-flight requests per task; submissions beyond it fail.
    pub max_requests: usize,
    /// Maximum concurrently processed items per task.
    pub pipeline_concurrency: usize,
    /// Slot interval applied when a request specifies none.
    pub default_interval: Option<Duration>,
    /// Deadline for extra side-channel retrieval.
    pub queue_timeout: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        CrawlerConfig {
            max_requests: 1000,
            pipeline_concurrency: num_cpus::get().min(8),
            default_interval: None,
            queue_timeout: Duration::from_secs(10),
        }
    }
}

pub struct CrawlerBuilder {
    config: CrawlerConfig,
    handlers: HandlerRegistry,
    middlewares: Vec<(i32, Box<dyn Middleware>)>,
    pipelines: Vec<(i32, Box<dyn Pipeline>)>,
    downloader: Option<Arc<dyn Downloader>>,
    filter: Option<Arc<Filter>>,
}

impl Default for CrawlerBuilder {
    fn default() -> Self {
        CrawlerBuilder {
            config: CrawlerConfig::default(),
            handlers: HandlerRegistry::new(),
            middlewares: Vec::new(),
            pipelines: Vec::new(),
            downloader: None,
            filter: None,
        }
    }
}

impl CrawlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of in-flight requests per task.
    pub fn max_requests(mut self, limit: usize) -> Self {
        self.config.max_requests = limit;
        self
    }

    /// Sets the maximum number of concurrently processed items per task.
    pub fn pipeline_concurrency(mut self, limit: usize) -> Self {
        self.config.pipeline_concurrency = limit;
        self
    }

    /// Sets the slot interval applied when a request specifies none.
    pub fn default_interval(mut self, interval: Duration) -> Self {
        self.config.default_interval = Some(interval);
        self
    }

    /// Sets the deadline for extra side-channel retrieval.
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.config.queue_timeout = timeout;
        self
    }

    /// Registers a crawl entry point under a name.
    pub fn register_entry<F, Fut>(mut self, name: impl Into<String>, entry: F) -> Self
    where
        F: Fn(Context, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
    {
        self.handlers.register_entry(name, entry);
        self
    }

    /// Registers a response callback under a name.
    pub fn register_callback<F, Fut>(mut self, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(Context, Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
    {
        self.handlers.register_callback(name, callback);
        self
    }

    /// Registers an error callback under a name.
    pub fn register_errback<F>(mut self, name: impl Into<String>, errback: F) -> Self
    where
        F: Fn(Context, Option<Response>, CrawlError) + Send + Sync + 'static,
    {
        self.handlers.register_errback(name, errback);
        self
    }

    /// Adds a middleware at the given priority. Duplicates are rejected at
    /// `build()` time.
    pub fn add_middleware<M>(mut self, priority: i32, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middlewares.push((priority, Box::new(middleware)));
        self
    }

    /// Adds an item pipeline at the given priority. Duplicates are rejected
    /// at `build()` time.
    pub fn add_pipeline<P>(mut self, priority: i32, pipeline: P) -> Self
    where
        P: Pipeline + 'static,
    {
        self.pipelines.push((priority, Box::new(pipeline)));
        self
    }

    /// Sets a custom downloader; defaults to [`HttpDownloader`].
    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Shares an externally owned duplicate filter.
    pub fn filter(mut self, filter: Arc<Filter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Validates the configuration and assembles the `Crawler`.
    pub fn build(mut self) -> Result<Crawler, CrawlError> {
        if self.config.max_requests == 0 {
            return Err(CrawlError::Configuration(
                "max_requests must be greater than 0".to_string(),
            ));
        }
        if self.config.pipeline_concurrency == 0 {
            return Err(CrawlError::Configuration(
                "pipeline_concurrency must be greater than 0".to_string(),
            ));
        }

        // A crawl needs somewhere to land its items.
        if self.pipelines.is_empty() {
            debug!("no pipelines registered, installing console log pipeline");
            self.pipelines.push((0, Box::new(ConsoleLogPipeline::new())));
        }

        let mut middlewares = MiddlewareSet::new();
        for (priority, middleware) in self.middlewares {
            middlewares.insert(priority, middleware)?;
        }
        let mut pipelines = PipelineSet::new();
        for (priority, pipeline) in self.pipelines {
            pipelines.insert(priority, pipeline)?;
        }

        let downloader = match self.downloader {
            Some(downloader) => downloader,
            None => Arc::new(HttpDownloader::new()?),
        };
        let filter = self.filter.unwrap_or_else(|| Arc::new(Filter::new()));

        Ok(Crawler::new(
            self.config,
            Arc::new(self.handlers),
            Arc::new(middlewares),
            Arc::new(pipelines),
            downloader,
            filter,
            Arc::new(StatCollector::new()),
        ))
    }
}
