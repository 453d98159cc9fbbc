//! # Request Module
//!
//! The immutable-after-build descriptor for one fetch.
//!
//! ## Overview
//!
//! A [`Request`] carries the URL, method, body, and headers of a fetch plus
//! the per-request overrides the dispatcher honors: timeout, proxy, retry and
//! redirect limits, slot name with its concurrency/interval parameters, skip
//! flags, callback and errback references, and an opaque `extra` payload.
//!
//! Callbacks and errbacks are referenced by the **name** they were registered
//! under in the [`HandlerRegistry`](crate::handler::HandlerRegistry); the
//! dispatcher resolves them through that table, so a request is fully
//! serializable via [`RequestRecord`] without inspecting any function
//! pointer.
//!
//! Construction is fluent; once submitted a request is treated as immutable.

use crate::error::CrawlError;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// The slot every request falls into unless it names one explicitly.
pub const DEFAULT_SLOT: &str = "*";

/// Opaque caller-defined payload correlating a chain of yield/callback
/// cycles that belong to one logical record.
pub type Extra = Arc<dyn Any + Send + Sync>;

/// Descriptor for one fetch.
#[derive(Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub body: String,
    pub headers: HeaderMap,
    /// Key for the duplicate filter; unfiltered when absent.
    pub unique_key: Option<String>,
    /// Name of the registered callback receiving the response.
    pub callback: Option<String>,
    /// Name of the registered errback receiving failures.
    pub errback: Option<String>,
    pub referer: Option<String>,
    /// Accepted, then discarded without dispatch.
    pub skip: bool,
    /// Bypass the duplicate filter.
    pub skip_filter: bool,
    pub proxy: Option<Url>,
    pub timeout: Option<Duration>,
    pub retry_max_times: Option<u8>,
    pub retry_times: u8,
    pub redirect_max_times: Option<u8>,
    /// Statuses outside 2xx that still count as success.
    pub ok_http_codes: Vec<u16>,
    pub slot: Option<String>,
    pub concurrency: Option<u8>,
    pub interval: Option<Duration>,
    extra: Option<Extra>,
    extra_name: Option<&'static str>,
}

impl Request {
    /// Creates a GET request for the given URL.
    pub fn new(url: Url) -> Self {
        Request {
            url,
            method: Method::GET,
            body: String::new(),
            headers: HeaderMap::new(),
            unique_key: None,
            callback: None,
            errback: None,
            referer: None,
            skip: false,
            skip_filter: false,
            proxy: None,
            timeout: None,
            retry_max_times: None,
            retry_times: 0,
            redirect_max_times: None,
            ok_http_codes: Vec::new(),
            slot: None,
            concurrency: None,
            interval: None,
            extra: None,
            extra_name: None,
        }
    }

    /// Parses the URL and creates a GET request for it.
    pub fn parse(url: &str) -> Result<Self, CrawlError> {
        let url = Url::parse(url).map_err(|e| CrawlError::InvalidRequest(e.to_string()))?;
        Ok(Request::new(url))
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a header, silently ignoring names or values that are not valid
    /// HTTP header tokens.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_callback(mut self, name: impl Into<String>) -> Self {
        self.callback = Some(name.into());
        self
    }

    pub fn with_errback(mut self, name: impl Into<String>) -> Self {
        self.errback = Some(name.into());
        self
    }

    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: u8) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_proxy(mut self, proxy: Url) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_retry_max_times(mut self, times: u8) -> Self {
        self.retry_max_times = Some(times);
        self
    }

    pub fn with_redirect_max_times(mut self, times: u8) -> Self {
        self.redirect_max_times = Some(times);
        self
    }

    pub fn with_ok_http_codes(mut self, codes: Vec<u16>) -> Self {
        self.ok_http_codes = codes;
        self
    }

    pub fn with_skip(mut self) -> Self {
        self.skip = true;
        self
    }

    pub fn with_skip_filter(mut self) -> Self {
        self.skip_filter = true;
        self
    }

    /// Attaches an opaque extra payload, recording its type name for the
    /// side-channel and for serialization.
    pub fn with_extra<T: Any + Send + Sync>(mut self, extra: T) -> Self {
        self.extra_name = Some(std::any::type_name::<T>());
        self.extra = Some(Arc::new(extra));
        self
    }

    /// The attached extra payload, downcast to its concrete type.
    pub fn extra<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extra
            .clone()
            .and_then(|extra| extra.downcast::<T>().ok())
    }

    /// Type name recorded when the extra payload was attached.
    pub fn extra_name(&self) -> Option<&'static str> {
        self.extra_name
    }

    /// The slot this request throttles under.
    pub fn slot_or_default(&self) -> &str {
        self.slot.as_deref().unwrap_or(DEFAULT_SLOT)
    }

    /// Slot concurrency derived from this request; never below 1.
    pub fn effective_concurrency(&self) -> u8 {
        self.concurrency.unwrap_or(1).max(1)
    }

    /// Serializable snapshot with callbacks referenced by registered name.
    pub fn to_record(&self) -> RequestRecord {
        let headers = self
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        RequestRecord {
            url: self.url.to_string(),
            method: self.method.as_str().to_string(),
            body: self.body.clone(),
            headers,
            unique_key: self.unique_key.clone(),
            callback: self.callback.clone(),
            errback: self.errback.clone(),
            referer: self.referer.clone(),
            skip: self.skip,
            skip_filter: self.skip_filter,
            proxy: self.proxy.as_ref().map(Url::to_string),
            timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
            retry_max_times: self.retry_max_times,
            retry_times: self.retry_times,
            redirect_max_times: self.redirect_max_times,
            ok_http_codes: self.ok_http_codes.clone(),
            slot: self.slot.clone(),
            concurrency: self.concurrency,
            interval_ms: self.interval.map(|i| i.as_millis() as u64),
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url.as_str())
            .field("method", &self.method)
            .field("slot", &self.slot_or_default())
            .field("callback", &self.callback)
            .field("errback", &self.errback)
            .field("extra", &self.extra_name)
            .finish_non_exhaustive()
    }
}

/// Plain serialization surface for a [`Request`]. Callback and errback are
/// carried by registration name; the extra payload does not survive
/// serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub skip_filter: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max_times: Option<u8>,
    #[serde(default)]
    pub retry_times: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_max_times: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ok_http_codes: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

impl RequestRecord {
    /// Rebuilds a [`Request`] from the record. Callback names are carried
    /// as-is; resolution against the handler registry happens at submission.
    pub fn into_request(self) -> Result<Request, CrawlError> {
        let url = Url::parse(&self.url).map_err(|e| CrawlError::InvalidRequest(e.to_string()))?;
        let method = if self.method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(self.method.as_bytes())
                .map_err(|e| CrawlError::InvalidRequest(e.to_string()))?
        };
        let mut request = Request::new(url).with_method(method).with_body(self.body);
        for (name, value) in &self.headers {
            request = request.with_header(name, value);
        }
        request.unique_key = self.unique_key;
        request.callback = self.callback;
        request.errback = self.errback;
        request.referer = self.referer;
        request.skip = self.skip;
        request.skip_filter = self.skip_filter;
        request.proxy = match self.proxy {
            Some(proxy) => {
                Some(Url::parse(&proxy).map_err(|e| CrawlError::InvalidRequest(e.to_string()))?)
            }
            None => None,
        };
        request.timeout = self.timeout_ms.map(Duration::from_millis);
        request.retry_max_times = self.retry_max_times;
        request.retry_times = self.retry_times;
        request.redirect_max_times = self.redirect_max_times;
        request.ok_http_codes = self.ok_http_codes;
        request.slot = self.slot;
        request.concurrency = self.concurrency;
        request.interval = self.interval_ms.map(Duration::from_millis);
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct BookRecord {
        title: String,
    }

    #[test]
    fn extra_round_trips_by_type() {
        let request = Request::parse("https://example.com/books")
            .unwrap()
            .with_extra(BookRecord {
                title: "dune".into(),
            });

        let extra = request.extra::<BookRecord>().expect("payload attached");
        assert_eq!(extra.title, "dune");
        assert!(request.extra::<String>().is_none());
        assert!(request.extra_name().unwrap().ends_with("BookRecord"));
    }

    #[test]
    fn slot_defaults_to_star() {
        let request = Request::parse("https://example.com").unwrap();
        assert_eq!(request.slot_or_default(), DEFAULT_SLOT);
        assert_eq!(request.effective_concurrency(), 1);

        let request = request.with_slot("api").with_concurrency(0);
        assert_eq!(request.slot_or_default(), "api");
        assert_eq!(request.effective_concurrency(), 1, "clamped to 1");
    }

    #[test]
    fn record_round_trip_preserves_callback_names() {
        let request = Request::parse("https://example.com/detail?id=1")
            .unwrap()
            .with_method(Method::POST)
            .with_body("id=1")
            .with_header("accept", "application/json")
            .with_callback("parse_detail")
            .with_errback("on_error")
            .with_slot("detail")
            .with_concurrency(3)
            .with_interval(Duration::from_secs(2))
            .with_unique_key("detail-1");

        let json = serde_json::to_string(&request.to_record()).unwrap();
        let record: RequestRecord = serde_json::from_str(&json).unwrap();
        let rebuilt = record.into_request().unwrap();

        assert_eq!(rebuilt.url.as_str(), "https://example.com/detail?id=1");
        assert_eq!(rebuilt.method, Method::POST);
        assert_eq!(rebuilt.callback.as_deref(), Some("parse_detail"));
        assert_eq!(rebuilt.errback.as_deref(), Some("on_error"));
        assert_eq!(rebuilt.slot.as_deref(), Some("detail"));
        assert_eq!(rebuilt.concurrency, Some(3));
        assert_eq!(rebuilt.interval, Some(Duration::from_secs(2)));
        assert_eq!(rebuilt.unique_key.as_deref(), Some("detail-1"));
        assert_eq!(
            rebuilt.headers.get("accept").and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
    }
}
