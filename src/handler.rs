//! # Handler Module
//!
//! The explicit table mapping registered names to crawl callbacks.
//!
//! ## Overview
//!
//! Requests reference their callback and errback by name, and jobs reference
//! their entry point by name. All three tables are built once at startup
//! through the builder; dispatch is a plain table lookup, and serialized
//! requests recover handler names from this registry rather than from any
//! runtime introspection of function pointers.

use crate::context::Context;
use crate::error::CrawlError;
use crate::response::Response;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A response callback: receives the task context and the finished response,
/// and may yield further requests and items through the context.
pub type Callback = Arc<dyn Fn(Context, Response) -> BoxFuture<'static, Result<(), CrawlError>> + Send + Sync>;

/// An error callback: receives the context, the response when one was built,
/// and the failure.
pub type Errback = Arc<dyn Fn(Context, Option<Response>, CrawlError) + Send + Sync>;

/// A crawl entry point: invoked once per task with the job's arguments.
pub type Entry = Arc<dyn Fn(Context, serde_json::Value) -> BoxFuture<'static, Result<(), CrawlError>> + Send + Sync>;

/// Name→handler tables, immutable after the builder finishes.
#[derive(Default)]
pub struct HandlerRegistry {
    callbacks: HashMap<String, Callback>,
    errbacks: HashMap<String, Errback>,
    entries: HashMap<String, Entry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_callback<F, Fut>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(Context, Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
    {
        self.callbacks.insert(
            name.into(),
            Arc::new(move |ctx, response| Box::pin(callback(ctx, response))),
        );
    }

    pub fn register_errback<F>(&mut self, name: impl Into<String>, errback: F)
    where
        F: Fn(Context, Option<Response>, CrawlError) + Send + Sync + 'static,
    {
        self.errbacks.insert(name.into(), Arc::new(errback));
    }

    pub fn register_entry<F, Fut>(&mut self, name: impl Into<String>, entry: F)
    where
        F: Fn(Context, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
    {
        self.entries.insert(
            name.into(),
            Arc::new(move |ctx, args| Box::pin(entry(ctx, args))),
        );
    }

    pub fn has_callback(&self, name: &str) -> bool {
        self.callbacks.contains_key(name)
    }

    pub fn has_errback(&self, name: &str) -> bool {
        self.errbacks.contains_key(name)
    }

    pub fn callback(&self, name: &str) -> Result<Callback, CrawlError> {
        self.callbacks
            .get(name)
            .cloned()
            .ok_or_else(|| CrawlError::UnknownHandler(name.to_string()))
    }

    pub fn errback(&self, name: &str) -> Result<Errback, CrawlError> {
        self.errbacks
            .get(name)
            .cloned()
            .ok_or_else(|| CrawlError::UnknownHandler(name.to_string()))
    }

    pub fn entry(&self, name: &str) -> Result<Entry, CrawlError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| CrawlError::UnknownHandler(name.to_string()))
    }
}
