//! Sink appending items as JSON lines, one file per logical file name.
//!
//! File handles are opened on first use and kept until the owning task
//! stops; unsupported item types are logged and passed through.

use super::{Item, Pipeline};
use crate::error::CrawlError;
use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Item kind consumed by [`JsonLinesPipeline`].
pub struct JsonLinesItem {
    pub file_name: String,
    pub unique_key: Option<String>,
    pub data: serde_json::Value,
}

impl Item for JsonLinesItem {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn unique_key(&self) -> Option<&str> {
        self.unique_key.as_deref()
    }

    fn data(&self) -> serde_json::Value {
        self.data.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct JsonLinesPipeline {
    dir: PathBuf,
    files: Mutex<HashMap<String, File>>,
}

impl JsonLinesPipeline {
    /// Writes `<dir>/<file_name>.jsonl` files under the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonLinesPipeline {
            dir: dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn append(&self, file_name: &str, line: &str) -> std::io::Result<()> {
        let mut files = self.files.lock();
        if !files.contains_key(file_name) {
            let path = self.dir.join(format!("{file_name}.jsonl"));
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            files.insert(file_name.to_string(), file);
        }
        let file = files.get_mut(file_name).expect("entry inserted above");
        writeln!(file, "{line}")
    }
}

#[async_trait]
impl Pipeline for JsonLinesPipeline {
    fn name(&self) -> &'static str {
        "json-lines"
    }

    async fn process_item(&self, item: Box<dyn Item>) -> Result<Option<Box<dyn Item>>, CrawlError> {
        let Some(jsonl) = item.as_any().downcast_ref::<JsonLinesItem>() else {
            warn!("item kind '{}' not supported by json-lines", item.name());
            return Ok(Some(item));
        };

        if jsonl.file_name.is_empty() {
            return Err(CrawlError::Pipeline("file name is empty".into()));
        }

        let line = serde_json::to_string(&jsonl.data)?;
        self.append(&jsonl.file_name, &line)
            .map_err(|e| CrawlError::Pipeline(e.to_string()))?;
        Ok(Some(item))
    }

    async fn close(&self) {
        let mut files = self.files.lock();
        for (name, file) in files.drain() {
            if let Err(e) = file.sync_all() {
                warn!("failed to sync jsonl file '{name}': {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::TestItem;
    use super::*;

    #[tokio::test]
    async fn appends_one_json_line_per_item() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = JsonLinesPipeline::new(dir.path());

        for id in 0..2 {
            let item = Box::new(JsonLinesItem {
                file_name: "books".into(),
                unique_key: None,
                data: serde_json::json!({"id": id}),
            });
            pipeline.process_item(item).await.unwrap();
        }
        pipeline.close().await;

        let written = std::fs::read_to_string(dir.path().join("books.jsonl")).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"id":0}"#);
        assert_eq!(lines[1], r#"{"id":1}"#);
    }

    #[tokio::test]
    async fn unsupported_items_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = JsonLinesPipeline::new(dir.path());

        let item = Box::new(TestItem {
            key: None,
            payload: serde_json::json!({}),
        });
        let forwarded = pipeline.process_item(item).await.unwrap();
        assert!(forwarded.is_some());
    }

    #[tokio::test]
    async fn empty_file_name_is_a_pipeline_error() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = JsonLinesPipeline::new(dir.path());

        let item = Box::new(JsonLinesItem {
            file_name: String::new(),
            unique_key: None,
            data: serde_json::json!({}),
        });
        assert!(pipeline.process_item(item).await.is_err());
    }
}
