//! # Middleware Module
//!
//! The ordered request/response interception chain.
//!
//! ## Overview
//!
//! Middlewares register at an explicit integer priority. Outbound
//! (request-bound) traversal runs priority-ascending; inbound
//! (response-bound) traversal mirrors it descending, giving onion-style
//! wrapping. Each interceptor may pass a value through unchanged, mutate it,
//! short-circuit the remainder of the chain, or abort with an error that is
//! returned to the caller without reaching the transport.
//!
//! Registration rejects duplicate middleware names and duplicate priorities.

use crate::error::CrawlError;
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::trace;

/// Outcome of one interceptor stage.
pub enum MiddlewareAction<T> {
    /// Hand the (possibly mutated) value to the next stage.
    Continue(T),
    /// Skip the remainder of the chain and proceed with this value.
    Skip(T),
}

/// An interceptor in the request/response chain.
///
/// Both hooks default to passing the value through, so a middleware
/// implements only the directions it cares about.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stable identity used for duplicate rejection.
    fn name(&self) -> &'static str;

    async fn process_request(
        &self,
        request: Request,
    ) -> Result<MiddlewareAction<Request>, CrawlError> {
        Ok(MiddlewareAction::Continue(request))
    }

    async fn process_response(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, CrawlError> {
        Ok(MiddlewareAction::Continue(response))
    }
}

/// The ordered interceptor chain.
#[derive(Default)]
pub struct MiddlewareSet {
    chain: BTreeMap<i32, Box<dyn Middleware>>,
}

impl MiddlewareSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a middleware at the given priority.
    pub fn insert(
        &mut self,
        priority: i32,
        middleware: Box<dyn Middleware>,
    ) -> Result<(), CrawlError> {
        if self
            .chain
            .values()
            .any(|existing| existing.name() == middleware.name())
        {
            return Err(CrawlError::DuplicateMiddlewareName(
                middleware.name().to_string(),
            ));
        }
        if self.chain.contains_key(&priority) {
            return Err(CrawlError::DuplicateMiddlewarePriority(priority));
        }
        self.chain.insert(priority, middleware);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Runs the outbound chain, priority-ascending.
    pub async fn process_request(&self, request: Request) -> Result<Request, CrawlError> {
        let mut current = request;
        for (priority, middleware) in self.chain.iter() {
            match middleware.process_request(current).await? {
                MiddlewareAction::Continue(request) => current = request,
                MiddlewareAction::Skip(request) => {
                    trace!(
                        middleware = middleware.name(),
                        priority, "request middleware short-circuited the chain"
                    );
                    return Ok(request);
                }
            }
        }
        Ok(current)
    }

    /// Runs the inbound chain, priority-descending.
    pub async fn process_response(&self, response: Response) -> Result<Response, CrawlError> {
        let mut current = response;
        for (priority, middleware) in self.chain.iter().rev() {
            match middleware.process_response(current).await? {
                MiddlewareAction::Continue(response) => current = response,
                MiddlewareAction::Skip(response) => {
                    trace!(
                        middleware = middleware.name(),
                        priority, "response middleware short-circuited the chain"
                    );
                    return Ok(response);
                }
            }
        }
        Ok(current)
    }
}
