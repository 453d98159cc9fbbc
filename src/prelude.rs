//! A "prelude" for users of the `trawler-core` crate.
//!
//! # Example
//!
//! ```
//! use trawler_core::prelude::*;
//! ```

pub use crate::{
    // Core structs
    Context,
    Crawler,
    CrawlerBuilder,
    Job,
    Request,
    Response,
    Task,
    TaskStatus,
    // Core traits
    Downloader,
    Item,
    Middleware,
    Pipeline,
    // Essential re-exports for trait implementation
    async_trait,
};

pub use crate::error::CrawlError;
pub use crate::middleware::MiddlewareAction;
pub use crate::pipeline::JsonLinesItem;
pub use url::Url;
