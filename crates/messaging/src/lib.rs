//! One publish/subscribe façade over a log-stream broker (NATS `JetStream`)
//! or a group-cursor broker (Redis Streams).
//!
//! The backend is chosen from [`Config`] at startup; callers only see
//! [`EventStream`], so handlers, retry accounting, dead-letter forwarding and
//! trace propagation behave the same on either broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
mod error;

pub use config::{BackendKind, Config, MessagingConfig, ObservabilityConfig, TracingConfig};
pub use error::Error;

pub use ebrick_events::{
    ConsumerGroupConfig, DeliveryMode, ErrorKind, Event, EventContext, EventHandler, EventStream,
    StartCursor, StreamError, handler_fn,
};

use async_trait::async_trait;
use ebrick_events::TraceBridge;
use ebrick_events_cursor::{CursorEvents, CursorEventsOptions};
use ebrick_events_nats::{JetStreamEvents, JetStreamEventsOptions};
use ebrick_events_redis::{RedisBackend, RedisBackendOptions};
use opentelemetry::Context;
use tracing::info;

/// The event streams of an application, backed by exactly one broker.
#[derive(Clone, Debug)]
pub enum EventStreams {
    /// NATS `JetStream`.
    LogStream(JetStreamEvents),

    /// Redis Streams.
    GroupCursor(CursorEvents<RedisBackend>),
}

impl EventStreams {
    /// Connects the backend selected by `config`.
    ///
    /// Returns `Ok(None)` without touching the network when messaging is
    /// disabled.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the backend kind is unsupported or the
    /// URL is missing, and a transport error if the broker cannot be reached.
    pub async fn connect(config: &Config) -> Result<Option<Self>, Error> {
        let Some(kind) = config.validate()? else {
            info!("messaging disabled");
            return Ok(None);
        };

        let messaging = &config.messaging;
        let trace = TraceBridge::from_enabled(config.observability.tracing.enable);

        info!(backend = %kind, tracing = trace.is_enabled(), "connecting event streams");

        let streams = match kind {
            BackendKind::Nats => Self::LogStream(
                JetStreamEvents::connect(JetStreamEventsOptions {
                    url: messaging.url.clone(),
                    name: messaging.client_name.clone(),
                    username: messaging.username.clone(),
                    password: messaging.password.clone(),
                    trace,
                })
                .await?,
            ),
            BackendKind::Redis => {
                let backend = RedisBackend::connect(RedisBackendOptions {
                    url: messaging.url.clone(),
                    username: messaging.username.clone(),
                    password: messaging.password.clone(),
                })
                .await?;

                Self::GroupCursor(CursorEvents::new(
                    backend,
                    CursorEventsOptions {
                        poll_timeout: messaging.poll_timeout,
                        trace,
                    },
                ))
            }
        };

        Ok(Some(streams))
    }

    /// The backend in use.
    #[must_use]
    pub const fn backend_kind(&self) -> BackendKind {
        match self {
            Self::LogStream(_) => BackendKind::Nats,
            Self::GroupCursor(_) => BackendKind::Redis,
        }
    }
}

impl From<JetStreamEvents> for EventStreams {
    fn from(events: JetStreamEvents) -> Self {
        Self::LogStream(events)
    }
}

impl From<CursorEvents<RedisBackend>> for EventStreams {
    fn from(events: CursorEvents<RedisBackend>) -> Self {
        Self::GroupCursor(events)
    }
}

#[async_trait]
impl EventStream for EventStreams {
    type Error = Error;

    async fn publish_with_context(
        &self,
        cx: &Context,
        topic: &str,
        event: &Event,
    ) -> Result<(), Error> {
        match self {
            Self::LogStream(events) => events.publish_with_context(cx, topic, event).await?,
            Self::GroupCursor(events) => events.publish_with_context(cx, topic, event).await?,
        }

        Ok(())
    }

    async fn subscribe<H>(&self, topic: &str, group: &str, handler: H) -> Result<(), Error>
    where
        H: EventHandler,
    {
        match self {
            Self::LogStream(events) => events.subscribe(topic, group, handler).await?,
            Self::GroupCursor(events) => events.subscribe(topic, group, handler).await?,
        }

        Ok(())
    }

    async fn subscribe_dead_letter<H>(&self, topic: &str, handler: H) -> Result<(), Error>
    where
        H: EventHandler,
    {
        match self {
            Self::LogStream(events) => events.subscribe_dead_letter(topic, handler).await?,
            Self::GroupCursor(events) => events.subscribe_dead_letter(topic, handler).await?,
        }

        Ok(())
    }

    async fn create_stream(&self, name: &str, subjects: &[String]) -> Result<(), Error> {
        match self {
            Self::LogStream(events) => events.create_stream(name, subjects).await?,
            Self::GroupCursor(events) => events.create_stream(name, subjects).await?,
        }

        Ok(())
    }

    async fn create_consumer_group(
        &self,
        stream: &str,
        name: &str,
        config: ConsumerGroupConfig,
    ) -> Result<(), Error> {
        match self {
            Self::LogStream(events) => events.create_consumer_group(stream, name, config).await?,
            Self::GroupCursor(events) => {
                events.create_consumer_group(stream, name, config).await?;
            }
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        match self {
            Self::LogStream(events) => events.close().await?,
            Self::GroupCursor(events) => events.close().await?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use assert_matches::assert_matches;
    use serial_test::serial;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Debug, thiserror::Error)]
    #[error("handler failed")]
    struct HandlerFailed;

    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
    }

    #[tokio::test]
    async fn test_disabled_messaging_constructs_nothing() {
        // The URL is unreachable; a disabled config must not dial it.
        let config = Config::default()
            .with_backend(BackendKind::Redis, "redis://127.0.0.1:1")
            .with_tracing(true);
        let config = Config {
            messaging: MessagingConfig {
                enable: false,
                ..config.messaging
            },
            ..config
        };

        assert_matches!(EventStreams::connect(&config).await, Ok(None));
    }

    #[tokio::test]
    async fn test_unsupported_backend_is_a_configuration_error() {
        let config = Config::from_toml(
            "[messaging]\nenable = true\ntype = \"kafka\"\nurl = \"kafka://localhost\"\n",
        )
        .unwrap();

        let error = EventStreams::connect(&config).await.unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_missing_url_is_a_configuration_error() {
        let config = Config::default().with_backend(BackendKind::Nats, " ");

        let error = EventStreams::connect(&config).await.unwrap_err();

        assert_matches!(error, Error::Configuration(_));
    }

    #[tokio::test]
    async fn test_invalid_redis_url_is_a_configuration_error() {
        let config = Config::default().with_backend(BackendKind::Redis, "not a url");

        let error = EventStreams::connect(&config).await.unwrap_err();

        assert_matches!(error, Error::Redis(_));
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    async fn round_trip(config: Config, stream: &str, topic: &str) {
        let events = EventStreams::connect(&config).await.unwrap().unwrap();

        events
            .create_stream(stream, &[format!("{stream}.>")])
            .await
            .unwrap();

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let handler = handler_fn(move |event: Event, _context: EventContext| {
            let sender = sender.clone();
            async move {
                let _ = sender.send(event.id().to_string());
                Ok::<(), HandlerFailed>(())
            }
        });
        events.subscribe(topic, "billing", handler).await.unwrap();

        let empty_group = handler_fn(|_event: Event, _context: EventContext| async {
            Ok::<(), HandlerFailed>(())
        });
        let error = events.subscribe(topic, "", empty_group).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidArgument);

        let event = Event::new("test", "order.created", &"payload")
            .unwrap()
            .with_id("e1");
        events.publish(topic, &event).await.unwrap();

        let received = timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "e1");

        events.close().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "Requires Redis server"]
    async fn test_redis_round_trip() {
        let config = Config::default()
            .with_backend(BackendKind::Redis, "redis://127.0.0.1:6379")
            .with_poll_timeout(Duration::from_millis(100))
            .with_tracing(true);
        let stream = unique("orders");

        round_trip(config, &stream, &stream).await;
    }

    #[tokio::test]
    #[serial]
    #[ignore = "Requires NATS server"]
    async fn test_nats_round_trip() {
        let config = Config::default()
            .with_backend(BackendKind::Nats, "nats://localhost:4222")
            .with_tracing(true);
        let stream = unique("ORDERS");

        round_trip(config, &stream, &format!("{stream}.created")).await;
    }
}
