//! The response descriptor handed to callbacks.
//!
//! A [`Response`] wraps the transport result (status, headers, fully-read
//! body) together with a back-reference to its originating [`Request`];
//! ownership of the request's extra payload passes through unchanged. It is
//! immutable once constructed.

use crate::request::Request;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;
use url::Url;

#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    request: Request,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>, request: Request) -> Self {
        Response {
            status,
            headers,
            body,
            request,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A single header value, when present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// The fully-read response body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body decoded as UTF-8, lossily.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// The originating request.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The originating request's URL.
    pub fn url(&self) -> &Url {
        &self.request.url
    }

    /// The extra payload carried through from the originating request.
    pub fn extra<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.request.extra::<T>()
    }
}
