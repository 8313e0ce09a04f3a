use crate::{ConsumerGroupConfig, Event, EventHandler, StreamError};

use std::fmt::Debug;

use async_trait::async_trait;
use opentelemetry::Context;

/// A publish/subscribe contract over one broker.
///
/// Implementations own their broker connection and must be safe for
/// concurrent use: callers never lock anything themselves.
#[async_trait]
pub trait EventStream
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the stream.
    type Error: StreamError;

    /// Publishes `event` to `topic`, propagating `cx` when tracing is enabled.
    /// Returns once the broker acknowledged the append.
    async fn publish_with_context(
        &self,
        cx: &Context,
        topic: &str,
        event: &Event,
    ) -> Result<(), Self::Error>;

    /// Publishes `event` to `topic` under the current trace context.
    async fn publish(&self, topic: &str, event: &Event) -> Result<(), Self::Error> {
        let cx = Context::current();
        self.publish_with_context(&cx, topic, event).await
    }

    /// Registers a durable, load-balanced consumer `group` on `topic` and
    /// starts delivering to `handler`. Returns once the group is registered.
    async fn subscribe<H>(&self, topic: &str, group: &str, handler: H) -> Result<(), Self::Error>
    where
        H: EventHandler;

    /// Delivers dead-lettered messages on `topic` to `handler`, without retry.
    async fn subscribe_dead_letter<H>(&self, topic: &str, handler: H) -> Result<(), Self::Error>
    where
        H: EventHandler;

    /// Creates a stream capturing `subjects`. Idempotent.
    async fn create_stream(&self, name: &str, subjects: &[String]) -> Result<(), Self::Error>;

    /// Creates consumer group `name` on `stream`. Idempotent.
    async fn create_consumer_group(
        &self,
        stream: &str,
        name: &str,
        config: ConsumerGroupConfig,
    ) -> Result<(), Self::Error>;

    /// Stops every delivery loop and releases the broker connection.
    async fn close(&self) -> Result<(), Self::Error>;
}
