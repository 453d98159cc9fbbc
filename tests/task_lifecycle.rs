//! End-to-end lifecycle tests: entry → requests → callbacks → items →
//! natural drain, plus rejection, isolation, and cancellation behavior.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use trawler_core::error::CrawlError;
use trawler_core::pipeline::{Item, Pipeline};
use trawler_core::prelude::*;
use trawler_core::request::Request;
use trawler_core::response::Response;

/// In-memory transport: answers every request with `body:<path>`, fails
/// paths under `/fail`, reports `/ignore` paths as the ignorable class, and
/// records call counts and peak concurrency.
struct MockDownloader {
    delay: Option<Duration>,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl MockDownloader {
    fn new() -> Arc<Self> {
        Self::with_delay(None)
    }

    fn with_delay(delay: Option<Duration>) -> Arc<Self> {
        Arc::new(MockDownloader {
            delay,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downloader for MockDownloader {
    async fn download(&self, request: &Request) -> Result<Response, CrawlError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let path = request.url.path().to_string();
        if path.starts_with("/fail") {
            return Err(CrawlError::Download(format!("refused: {path}")));
        }
        if path.starts_with("/ignore") {
            return Err(CrawlError::IgnoreRequest);
        }
        Ok(Response::new(
            reqwest::StatusCode::OK,
            reqwest::header::HeaderMap::new(),
            format!("body:{path}").into_bytes(),
            request.clone(),
        ))
    }
}

/// Pipeline capturing every item payload it sees.
struct Recording {
    seen: Arc<Mutex<Vec<serde_json::Value>>>,
}

#[async_trait]
impl Pipeline for Recording {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn process_item(&self, item: Box<dyn Item>) -> Result<Option<Box<dyn Item>>, CrawlError> {
        self.seen.lock().push(item.data());
        Ok(Some(item))
    }
}

struct PageItem {
    path: String,
}

impl Item for PageItem {
    fn name(&self) -> &'static str {
        "page"
    }

    fn data(&self) -> serde_json::Value {
        serde_json::json!({ "path": self.path })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn request_to(path: &str) -> Request {
    Request::parse(&format!("https://crawl.test{path}")).unwrap()
}

#[tokio::test]
async fn crawl_drains_to_success_and_collects_items() {
    let downloader = MockDownloader::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let crawler = Crawler::builder()
        .downloader(downloader.clone())
        .add_pipeline(
            10,
            Recording {
                seen: Arc::clone(&seen),
            },
        )
        .register_entry("start", |ctx, _args| async move {
            for id in 0..3 {
                ctx.yield_request(request_to(&format!("/list/{id}")).with_callback("parse"))
                    .await?;
            }
            Ok(())
        })
        .register_callback("parse", |ctx, response| async move {
            let path = response.url().path().to_string();
            ctx.yield_item(Box::new(PageItem { path })).await
        })
        .build()
        .unwrap();

    let (status, _task) = crawler.run("start", serde_json::Value::Null).await.unwrap();

    assert_eq!(status, TaskStatus::Success);
    assert_eq!(downloader.calls(), 3);

    let mut paths: Vec<String> = seen
        .lock()
        .iter()
        .map(|v| v["path"].as_str().unwrap().to_string())
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["/list/0", "/list/1", "/list/2"]);

    let stats = crawler.stats();
    assert_eq!(stats.requests_succeeded.load(Ordering::SeqCst), 3);
    assert_eq!(stats.item_success.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn empty_entry_transitions_to_success_without_external_signal() {
    let crawler = Crawler::builder()
        .downloader(MockDownloader::new())
        .register_entry("noop", |_ctx, _args| async move { Ok(()) })
        .build()
        .unwrap();

    let (status, task) = crawler.run("noop", serde_json::Value::Null).await.unwrap();
    assert_eq!(status, TaskStatus::Success);
    assert_eq!(task.stop_reason(), None);
}

#[tokio::test]
async fn callbacks_can_chain_follow_up_requests() {
    let downloader = MockDownloader::new();

    let crawler = Crawler::builder()
        .downloader(downloader.clone())
        .register_entry("start", |ctx, _args| async move {
            ctx.yield_request(request_to("/list").with_callback("parse_list"))
                .await
        })
        .register_callback("parse_list", |ctx, _response| async move {
            ctx.yield_request(request_to("/detail/1").with_callback("parse_detail"))
                .await
        })
        .register_callback("parse_detail", |_ctx, response| async move {
            assert_eq!(response.text(), "body:/detail/1");
            Ok(())
        })
        .build()
        .unwrap();

    let (status, _task) = crawler.run("start", serde_json::Value::Null).await.unwrap();
    assert_eq!(status, TaskStatus::Success);
    assert_eq!(downloader.calls(), 2);
}

#[tokio::test]
async fn submissions_beyond_max_in_flight_are_rejected() {
    // Fetches never finish within the test window, so accepted requests
    // stay in flight while the excess submissions are turned away.
    let downloader = MockDownloader::with_delay(Some(Duration::from_secs(3600)));
    let rejected = Arc::new(AtomicUsize::new(0));
    let rejected_in_entry = Arc::clone(&rejected);

    let crawler = Crawler::builder()
        .downloader(downloader)
        .max_requests(2)
        .register_entry("start", move |ctx, _args| {
            let rejected = Arc::clone(&rejected_in_entry);
            async move {
                for id in 0..5 {
                    let result = ctx
                        .yield_request(request_to(&format!("/slow/{id}")).with_callback("parse"))
                        .await;
                    if matches!(result, Err(CrawlError::ExceededMaxRequests)) {
                        rejected.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Ok(())
            }
        })
        .register_callback("parse", |_ctx, _response| async move { Ok(()) })
        .build()
        .unwrap();

    let task = crawler.task(Job::new("start"));
    task.start().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rejected.load(Ordering::SeqCst), 3, "2 admitted, 3 rejected");

    task.cancel();
    assert_eq!(task.wait().await, TaskStatus::Failure);
}

#[tokio::test]
async fn a_panicking_callback_reaches_the_errback_and_the_dispatcher_survives() {
    let downloader = MockDownloader::new();
    let panics_seen = Arc::new(Mutex::new(Vec::new()));
    let panics_for_errback = Arc::clone(&panics_seen);

    let crawler = Crawler::builder()
        .downloader(downloader.clone())
        .register_entry("start", |ctx, _args| async move {
            ctx.yield_request(
                request_to("/boom")
                    .with_callback("explode")
                    .with_errback("record"),
            )
            .await?;
            ctx.yield_request(request_to("/ok").with_callback("fine"))
                .await
        })
        .register_callback("explode", |_ctx, _response| async move {
            panic!("callback blew up");
        })
        .register_callback("fine", |_ctx, response| async move {
            assert_eq!(response.text(), "body:/ok");
            Ok(())
        })
        .register_errback("record", move |_ctx, response, err| {
            if let CrawlError::CallbackPanic { message, backtrace } = &err {
                assert!(!backtrace.is_empty());
                panics_for_errback
                    .lock()
                    .push((message.clone(), response.is_some()));
            }
        })
        .build()
        .unwrap();

    let (status, _task) = crawler.run("start", serde_json::Value::Null).await.unwrap();

    // The panic was contained: the task still drained naturally and the
    // other request completed.
    assert_eq!(status, TaskStatus::Success);
    assert_eq!(downloader.calls(), 2);

    let seen = panics_seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "callback blew up");
    assert!(seen[0].1, "errback receives the built response");
}

#[tokio::test]
async fn transport_errors_reach_the_errback_and_ignorable_ones_do_not() {
    let downloader = MockDownloader::new();
    let errors = Arc::new(AtomicUsize::new(0));
    let errors_for_errback = Arc::clone(&errors);

    let crawler = Crawler::builder()
        .downloader(downloader.clone())
        .register_entry("start", |ctx, _args| async move {
            ctx.yield_request(
                request_to("/fail/one")
                    .with_callback("parse")
                    .with_errback("count"),
            )
            .await?;
            ctx.yield_request(
                request_to("/ignore/two")
                    .with_callback("parse")
                    .with_errback("count"),
            )
            .await
        })
        .register_callback("parse", |_ctx, _response| async move { Ok(()) })
        .register_errback("count", move |_ctx, _response, err| {
            assert!(matches!(err, CrawlError::Download(_)));
            errors_for_errback.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    let (status, _task) = crawler.run("start", serde_json::Value::Null).await.unwrap();

    assert_eq!(status, TaskStatus::Success, "failures still drain the task");
    assert_eq!(errors.load(Ordering::SeqCst), 1, "ignorable class is silent");

    let stats = crawler.stats();
    assert_eq!(stats.requests_failed.load(Ordering::SeqCst), 1);
    assert_eq!(stats.requests_ignored.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn extra_payloads_hand_off_between_cycles() {
    #[derive(Debug, PartialEq)]
    struct AuthorPage {
        author: String,
    }

    let crawler = Crawler::builder()
        .downloader(MockDownloader::new())
        .register_entry("start", |ctx, _args| async move {
            ctx.yield_extra(AuthorPage {
                author: "herbert".into(),
            })?;
            let got: AuthorPage = ctx.get_extra_within(Duration::from_secs(1)).await?;
            assert_eq!(got.author, "herbert");

            // Nothing else was published under this type name.
            let empty: Result<AuthorPage, _> =
                ctx.get_extra_within(Duration::from_millis(50)).await;
            assert!(matches!(empty, Err(CrawlError::QueueTimeout)));
            Ok(())
        })
        .build()
        .unwrap();

    let (status, _task) = crawler.run("start", serde_json::Value::Null).await.unwrap();
    assert_eq!(status, TaskStatus::Success);
}

#[tokio::test]
async fn cancellation_before_drain_fails_the_task_with_a_reason() {
    let downloader = MockDownloader::with_delay(Some(Duration::from_secs(3600)));

    let crawler = Crawler::builder()
        .downloader(downloader)
        .register_entry("start", |ctx, _args| async move {
            // Slot of one: the second request waits on the limiter until
            // cancellation unblocks it.
            ctx.yield_request(
                request_to("/slow/a")
                    .with_callback("parse")
                    .with_slot("narrow")
                    .with_concurrency(1),
            )
            .await?;
            ctx.yield_request(
                request_to("/slow/b")
                    .with_callback("parse")
                    .with_slot("narrow"),
            )
            .await
        })
        .register_callback("parse", |_ctx, _response| async move { Ok(()) })
        .build()
        .unwrap();

    let task = crawler.task(Job::new("start"));
    task.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    task.cancel();
    assert_eq!(task.wait().await, TaskStatus::Failure);
    assert_eq!(task.stop_reason().as_deref(), Some("task cancelled"));

    // Terminal states are absorbing.
    assert!(task.start().is_err());
}

#[tokio::test]
async fn slot_concurrency_caps_parallel_fetches_across_the_engine() {
    tokio::time::pause();

    let downloader = MockDownloader::with_delay(Some(Duration::from_millis(200)));

    let crawler = Crawler::builder()
        .downloader(downloader.clone())
        .register_entry("start", |ctx, _args| async move {
            for id in 0..5 {
                ctx.yield_request(
                    request_to(&format!("/s1/{id}"))
                        .with_callback("parse")
                        .with_slot("s1")
                        .with_concurrency(2)
                        .with_interval(Duration::from_secs(1)),
                )
                .await?;
            }
            Ok(())
        })
        .register_callback("parse", |_ctx, _response| async move { Ok(()) })
        .build()
        .unwrap();

    let (status, _task) = crawler.run("start", serde_json::Value::Null).await.unwrap();

    assert_eq!(status, TaskStatus::Success);
    assert_eq!(downloader.calls(), 5);
    assert!(
        downloader.peak() <= 2,
        "slot concurrency exceeded: {}",
        downloader.peak()
    );
}

#[tokio::test]
async fn duplicate_unique_keys_are_dispatched_once() {
    let downloader = MockDownloader::new();

    let crawler = Crawler::builder()
        .downloader(downloader.clone())
        .register_entry("start", |ctx, _args| async move {
            ctx.yield_request(
                request_to("/detail/7")
                    .with_callback("parse")
                    .with_unique_key("detail-7"),
            )
            .await?;
            ctx.yield_request(
                request_to("/detail/7")
                    .with_callback("parse")
                    .with_unique_key("detail-7"),
            )
            .await?;
            // The filter can be bypassed per request.
            ctx.yield_request(
                request_to("/detail/7")
                    .with_callback("parse")
                    .with_unique_key("detail-7")
                    .with_skip_filter(),
            )
            .await?;
            // Skip requests are accepted, then discarded without dispatch.
            ctx.yield_request(
                request_to("/detail/8")
                    .with_callback("parse")
                    .with_skip(),
            )
            .await
        })
        .register_callback("parse", |_ctx, _response| async move { Ok(()) })
        .build()
        .unwrap();

    let (status, _task) = crawler.run("start", serde_json::Value::Null).await.unwrap();

    assert_eq!(status, TaskStatus::Success);
    assert_eq!(downloader.calls(), 2, "one filtered fetch, one bypass");

    let stats = crawler.stats();
    assert_eq!(stats.requests_ignored.load(Ordering::SeqCst), 1);
    assert_eq!(stats.requests_skipped.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn aborting_middleware_keeps_the_transport_untouched() {
    struct RejectAll;

    #[async_trait]
    impl Middleware for RejectAll {
        fn name(&self) -> &'static str {
            "reject-all"
        }

        async fn process_request(
            &self,
            _request: Request,
        ) -> Result<MiddlewareAction<Request>, CrawlError> {
            Err(CrawlError::Callback("blocked by policy".into()))
        }
    }

    let downloader = MockDownloader::new();
    let errors = Arc::new(AtomicUsize::new(0));
    let errors_for_errback = Arc::clone(&errors);

    let crawler = Crawler::builder()
        .downloader(downloader.clone())
        .add_middleware(10, RejectAll)
        .register_entry("start", |ctx, _args| async move {
            ctx.yield_request(
                request_to("/anything")
                    .with_callback("parse")
                    .with_errback("count"),
            )
            .await
        })
        .register_callback("parse", |_ctx, _response| async move { Ok(()) })
        .register_errback("count", move |_ctx, _response, _err| {
            errors_for_errback.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    let (status, _task) = crawler.run("start", serde_json::Value::Null).await.unwrap();

    assert_eq!(status, TaskStatus::Success);
    assert_eq!(downloader.calls(), 0, "transport must never be reached");
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_handler_names_fail_submission_synchronously() {
    let crawler = Crawler::builder()
        .downloader(MockDownloader::new())
        .register_entry("start", |ctx, _args| async move {
            let no_callback = ctx.yield_request(request_to("/x")).await;
            assert!(matches!(no_callback, Err(CrawlError::InvalidRequest(_))));

            let unknown = ctx
                .yield_request(request_to("/x").with_callback("nope"))
                .await;
            assert!(matches!(unknown, Err(CrawlError::UnknownHandler(_))));
            Ok(())
        })
        .build()
        .unwrap();

    let (status, _task) = crawler.run("start", serde_json::Value::Null).await.unwrap();
    assert_eq!(status, TaskStatus::Success);
}

#[tokio::test]
async fn unknown_entry_aborts_the_task_controller() {
    let crawler = Crawler::builder()
        .downloader(MockDownloader::new())
        .register_entry("start", |_ctx, _args| async move { Ok(()) })
        .build()
        .unwrap();

    let task = crawler.task(Job::new("missing"));
    assert!(matches!(task.start(), Err(CrawlError::UnknownHandler(_))));
    assert_eq!(task.status(), TaskStatus::Failure);
}

#[tokio::test]
async fn entry_errors_fail_the_task() {
    let crawler = Crawler::builder()
        .downloader(MockDownloader::new())
        .register_entry("start", |_ctx, _args| async move {
            Err(CrawlError::Configuration("bad seed".into()))
        })
        .build()
        .unwrap();

    let (status, task) = crawler.run("start", serde_json::Value::Null).await.unwrap();
    assert_eq!(status, TaskStatus::Failure);
    assert!(task.stop_reason().unwrap().contains("bad seed"));
}

#[tokio::test]
async fn job_args_reach_the_entry() {
    let crawler = Crawler::builder()
        .downloader(MockDownloader::new())
        .register_entry("start", |_ctx, args| async move {
            assert_eq!(args["category"], "books");
            Ok(())
        })
        .build()
        .unwrap();

    let (status, _task) = crawler
        .run("start", serde_json::json!({ "category": "books" }))
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Success);
}
