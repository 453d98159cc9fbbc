//! # Extra Side-Channel
//!
//! Point-to-point handoff of opaque payloads between execution paths of one
//! task.
//!
//! ## Overview
//!
//! One path publishes a payload with [`ExtraExchange::publish`]
//! (non-blocking, buffered up to the global maximum in-flight count) and
//! another retrieves it with [`ExtraExchange::retrieve`], which waits up to
//! a bounded deadline and fails with [`CrawlError::QueueTimeout`] when no
//! matching publish occurs in time. Channels are keyed by the payload's type
//! name; this is a producer/consumer handoff, not a broadcast.
//!
//! Known limitation, preserved by design: because the key is the type name
//! alone, two unrelated producers publishing the same type within one task
//! share a channel and may deliver the wrong payload to the wrong consumer.

use crate::error::CrawlError;
use dashmap::DashMap;
use kanal::{AsyncReceiver, AsyncSender, bounded_async};
use std::any::Any;
use std::time::Duration;
use tracing::{trace, warn};

type Payload = Box<dyn Any + Send>;
type Channel = (AsyncSender<Payload>, AsyncReceiver<Payload>);

/// Type-name-keyed payload channels for one task.
pub struct ExtraExchange {
    channels: DashMap<&'static str, Channel>,
    capacity: usize,
}

impl ExtraExchange {
    /// `capacity` bounds each per-type buffer; it matches the scheduler's
    /// maximum in-flight request count.
    pub fn new(capacity: usize) -> Self {
        ExtraExchange {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn channel(&self, name: &'static str) -> Channel {
        self.channels
            .entry(name)
            .or_insert_with(|| bounded_async(self.capacity))
            .clone()
    }

    /// Publishes a payload without blocking. Fails when the buffer for this
    /// type name is full.
    pub fn publish<T: Any + Send>(&self, payload: T) -> Result<(), CrawlError> {
        let name = std::any::type_name::<T>();
        let (sender, _) = self.channel(name);
        trace!(extra = name, "publishing extra payload");
        match sender.try_send(Box::new(payload)) {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(extra = name, "extra buffer full, payload dropped");
                Err(CrawlError::ExceededMaxRequests)
            }
            Err(_) => Err(CrawlError::TaskStopped("extra channel closed".into())),
        }
    }

    /// Retrieves a payload of type `T`, waiting up to `timeout`.
    pub async fn retrieve<T: Any + Send>(&self, timeout: Duration) -> Result<T, CrawlError> {
        let name = std::any::type_name::<T>();
        let (_, receiver) = self.channel(name);
        trace!(extra = name, "awaiting extra payload");
        match tokio::time::timeout(timeout, receiver.recv()).await {
            Ok(Ok(payload)) => payload
                .downcast::<T>()
                .map(|boxed| *boxed)
                .map_err(|_| CrawlError::ExtraMismatch(name.to_string())),
            Ok(Err(_)) => Err(CrawlError::TaskStopped("extra channel closed".into())),
            Err(_) => Err(CrawlError::QueueTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct DetailKey(u64);

    #[derive(Debug, PartialEq)]
    struct OtherKey(u64);

    #[tokio::test]
    async fn retrieve_returns_only_matching_type() {
        let exchange = ExtraExchange::new(16);

        exchange.publish(DetailKey(7)).unwrap();
        exchange.publish(OtherKey(9)).unwrap();

        let got: DetailKey = exchange.retrieve(Duration::from_millis(100)).await.unwrap();
        assert_eq!(got, DetailKey(7));

        let other: OtherKey = exchange.retrieve(Duration::from_millis(100)).await.unwrap();
        assert_eq!(other, OtherKey(9));
    }

    #[tokio::test]
    async fn retrieve_times_out_without_a_publish() {
        tokio::time::pause();
        let exchange = ExtraExchange::new(16);

        let result: Result<DetailKey, _> = exchange.retrieve(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(CrawlError::QueueTimeout)));
    }

    #[tokio::test]
    async fn publish_before_retrieve_is_buffered() {
        let exchange = ExtraExchange::new(2);
        exchange.publish(DetailKey(1)).unwrap();
        exchange.publish(DetailKey(2)).unwrap();

        // Buffer is at capacity for this type name now.
        assert!(exchange.publish(DetailKey(3)).is_err());

        let first: DetailKey = exchange.retrieve(Duration::from_millis(100)).await.unwrap();
        let second: DetailKey = exchange.retrieve(Duration::from_millis(100)).await.unwrap();
        assert_eq!(first, DetailKey(1));
        assert_eq!(second, DetailKey(2));
    }

    #[tokio::test]
    async fn publisher_unblocks_a_waiting_consumer() {
        let exchange = std::sync::Arc::new(ExtraExchange::new(16));

        let consumer = {
            let exchange = std::sync::Arc::clone(&exchange);
            tokio::spawn(
                async move { exchange.retrieve::<DetailKey>(Duration::from_secs(5)).await },
            )
        };

        tokio::task::yield_now().await;
        exchange.publish(DetailKey(42)).unwrap();

        assert_eq!(consumer.await.unwrap().unwrap(), DetailKey(42));
    }
}
