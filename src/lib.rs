//! # trawler-core
//!
//! Core request-scheduling and lifecycle-tracking engine of the `trawler`
//! web-crawling framework.
//!
//! The engine governs how fetch requests are queued, rate-limited per
//! logical slot, dispatched in parallel, correlated back to registered
//! callbacks, and how completion of a crawl task is detected from the
//! in-flight counts of requests and produced items.
//!
//! ## Example
//!
//! ```rust,ignore
//! use trawler_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CrawlError> {
//!     let crawler = Crawler::builder()
//!         .register_entry("start", |ctx, _args| async move {
//!             ctx.yield_request(
//!                 Request::parse("https://example.com/")?.with_callback("parse"),
//!             )
//!             .await
//!         })
//!         .register_callback("parse", |ctx, response| async move {
//!             ctx.yield_item(Box::new(JsonLinesItem {
//!                 file_name: "pages".into(),
//!                 unique_key: None,
//!                 data: serde_json::json!({ "len": response.body().len() }),
//!             }))
//!             .await
//!         })
//!         .build()?;
//!
//!     let (status, _task) = crawler.run("start", serde_json::Value::Null).await?;
//!     println!("crawl finished: {status:?}");
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod context;
pub mod crawler;
pub mod downloader;
pub mod error;
pub mod filter;
pub mod handler;
pub mod middleware;
pub mod pipeline;
pub mod prelude;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod state;
pub mod stats;
pub mod task;

pub use builder::{CrawlerBuilder, CrawlerConfig};
pub use context::Context;
pub use crawler::Crawler;
pub use downloader::{Downloader, HttpDownloader};
pub use error::CrawlError;
pub use filter::Filter;
pub use middleware::{Middleware, MiddlewareAction};
pub use pipeline::{
    ConsoleLogPipeline, FilterPipeline, Item, ItemOutcome, JsonLinesItem, JsonLinesPipeline,
    Pipeline,
};
pub use request::{DEFAULT_SLOT, Request, RequestRecord};
pub use response::Response;
pub use scheduler::Scheduler;
pub use state::{MultiState, StateCounter};
pub use stats::StatCollector;
pub use task::{Job, Task, TaskStatus};

pub use async_trait::async_trait;
pub use tokio;
pub use url::Url;
