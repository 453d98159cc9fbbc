//! Records processed item keys into the shared duplicate filter, so later
//! requests carrying the same unique key are not dispatched again.

use super::{Item, Pipeline};
use crate::error::CrawlError;
use crate::filter::Filter;
use async_trait::async_trait;
use log::trace;
use std::sync::Arc;

pub struct FilterPipeline {
    filter: Arc<Filter>,
}

impl FilterPipeline {
    pub fn new(filter: Arc<Filter>) -> Self {
        FilterPipeline { filter }
    }
}

#[async_trait]
impl Pipeline for FilterPipeline {
    fn name(&self) -> &'static str {
        "filter"
    }

    async fn process_item(&self, item: Box<dyn Item>) -> Result<Option<Box<dyn Item>>, CrawlError> {
        if let Some(key) = item.unique_key() {
            trace!("recording item key '{key}' in filter");
            self.filter.exists_or_store(key);
        }
        Ok(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::TestItem;
    use super::*;

    #[tokio::test]
    async fn records_keys_and_passes_items_through() {
        let filter = Arc::new(Filter::new());
        let pipeline = FilterPipeline::new(Arc::clone(&filter));

        let item = Box::new(TestItem {
            key: Some("record-1".into()),
            payload: serde_json::json!({}),
        });
        let forwarded = pipeline.process_item(item).await.unwrap();
        assert!(forwarded.is_some(), "filter never consumes items");
        assert!(filter.contains("record-1"));
    }
}
