//! # Pipeline Module
//!
//! The ordered chain of item consumers.
//!
//! ## Overview
//!
//! Extracted items flow through every registered pipeline in priority order.
//! A pipeline receives one typed item and either rejects types it does not
//! support (logged, passed through, the chain continues) or processes it and
//! forwards it to the next stage. A processing error is recorded in the
//! engine's success/error/ignore counters and drops the item, but never
//! aborts the surrounding crawl.
//!
//! Registration mirrors the middleware chain: explicit integer priorities,
//! duplicate names and duplicate priorities rejected.

mod console;
mod filter;
mod json_lines;

pub use console::ConsoleLogPipeline;
pub use filter::FilterPipeline;
pub use json_lines::{JsonLinesItem, JsonLinesPipeline};

use crate::error::CrawlError;
use async_trait::async_trait;
use log::{debug, error};
use std::any::Any;
use std::collections::BTreeMap;

/// A unit of extracted structured data yielded for downstream persistence.
pub trait Item: Send + Sync + 'static {
    /// The item kind, matched by pipelines against the kinds they support.
    fn name(&self) -> &'static str;

    /// Key for the duplicate filter; unfiltered when absent.
    fn unique_key(&self) -> Option<&str> {
        None
    }

    /// The payload, serialized for sinks that persist it.
    fn data(&self) -> serde_json::Value;

    fn as_any(&self) -> &dyn Any;
}

/// Terminal outcome of one item's trip through the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Every stage processed or passed the item through.
    Success,
    /// A stage consumed or discarded the item.
    Ignored,
    /// A stage failed; the item was dropped.
    Error,
}

/// An item consumer in the pipeline chain.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Stable identity used for duplicate rejection.
    fn name(&self) -> &'static str;

    /// Processes one item. `Ok(Some)` forwards to the next stage, `Ok(None)`
    /// consumes the item, `Err` records an item error. A pipeline that does
    /// not support the item's type passes it through unchanged.
    async fn process_item(&self, item: Box<dyn Item>) -> Result<Option<Box<dyn Item>>, CrawlError>;

    /// Invoked once when the owning task stops; flush and release resources.
    async fn close(&self) {}
}

/// The ordered item-consumer chain.
#[derive(Default)]
pub struct PipelineSet {
    chain: BTreeMap<i32, Box<dyn Pipeline>>,
}

impl PipelineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pipeline at the given priority.
    pub fn insert(&mut self, priority: i32, pipeline: Box<dyn Pipeline>) -> Result<(), CrawlError> {
        if self
            .chain
            .values()
            .any(|existing| existing.name() == pipeline.name())
        {
            return Err(CrawlError::DuplicatePipelineName(
                pipeline.name().to_string(),
            ));
        }
        if self.chain.contains_key(&priority) {
            return Err(CrawlError::DuplicatePipelinePriority(priority));
        }
        self.chain.insert(priority, pipeline);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Runs one item through the chain, priority-ascending. Errors are
    /// contained here; the caller only records the outcome.
    pub async fn process(&self, item: Box<dyn Item>) -> ItemOutcome {
        let mut current = item;
        for (priority, pipeline) in self.chain.iter() {
            match pipeline.process_item(current).await {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    debug!(
                        "item consumed by pipeline '{}' at priority {}",
                        pipeline.name(),
                        priority
                    );
                    return ItemOutcome::Ignored;
                }
                Err(e) => {
                    error!("pipeline '{}' failed: {e}", pipeline.name());
                    return ItemOutcome::Error;
                }
            }
        }
        ItemOutcome::Success
    }

    /// Closes every pipeline, last priority first.
    pub async fn close(&self) {
        for (_, pipeline) in self.chain.iter().rev() {
            pipeline.close().await;
        }
    }
}
