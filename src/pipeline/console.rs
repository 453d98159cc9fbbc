//! Default sink logging every item; installed by the builder when no
//! pipeline is registered.

use super::{Item, Pipeline};
use crate::error::CrawlError;
use async_trait::async_trait;
use log::info;

pub struct ConsoleLogPipeline;

impl ConsoleLogPipeline {
    pub fn new() -> Self {
        ConsoleLogPipeline
    }
}

impl Default for ConsoleLogPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pipeline for ConsoleLogPipeline {
    fn name(&self) -> &'static str {
        "console-log"
    }

    async fn process_item(&self, item: Box<dyn Item>) -> Result<Option<Box<dyn Item>>, CrawlError> {
        info!("item {}: {}", item.name(), item.data());
        Ok(Some(item))
    }
}
