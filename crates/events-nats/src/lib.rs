//! Event streams over NATS `JetStream`.
//!
//! Streams, durable consumers, ack-wait, max-deliver and backoff are native
//! to the server. Delivery counts come from the server, so retry accounting
//! survives restarts; exhausted messages are forwarded to the dead-letter
//! subject recorded in the consumer's metadata and terminated.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod consumer;
mod delivery;
mod error;
mod headers;

pub use consumer::DEAD_LETTER_METADATA;
pub use error::Error;

use delivery::{Delivery, MessageStream, Mode};
use headers::headers_from_carrier;

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::{
    Consumer, Info as ConsumerInfo, IntoConsumerConfig, pull, push,
};
use async_nats::jetstream::stream::{Config as StreamConfig, StorageType, Stream};
use async_nats::jetstream::{self, Context as JetStreamContext};
use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use ebrick_events::{
    ConsumerGroupConfig, DeliveryMode, Event, EventHandler, EventStream, TraceBridge,
    require_non_empty,
};
use futures::StreamExt;
use opentelemetry::Context;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, instrument};

/// Client name announced to the server when none is configured.
pub const DEFAULT_CLIENT_NAME: &str = "NATS JetStream";

/// Reconnect attempts before the client gives up.
pub const MAX_RECONNECTS: usize = 10;

/// Pause between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Options for [`JetStreamEvents::connect`].
#[derive(Clone, Debug, Default)]
pub struct JetStreamEventsOptions {
    /// Server URL, e.g. `nats://localhost:4222`.
    pub url: String,

    /// Client name. Defaults to [`DEFAULT_CLIENT_NAME`].
    pub name: Option<String>,

    /// User for user/password authentication.
    pub username: Option<String>,

    /// Password for user/password authentication.
    pub password: Option<String>,

    /// Trace propagation through message headers.
    pub trace: TraceBridge,
}

enum GroupConsumer {
    Push(Consumer<push::Config>),
    Pull(Consumer<pull::Config>),
}

impl GroupConsumer {
    fn info(&self) -> &ConsumerInfo {
        match self {
            Self::Push(consumer) => consumer.cached_info(),
            Self::Pull(consumer) => consumer.cached_info(),
        }
    }

    async fn messages(&self) -> Result<MessageStream, Error> {
        match self {
            Self::Push(consumer) => Ok(consumer
                .messages()
                .await
                .map_err(|e| Error::Messages(e.to_string()))?
                .map(|message| message.map_err(|e| e.to_string()))
                .boxed()),
            Self::Pull(consumer) => Ok(consumer
                .messages()
                .await
                .map_err(|e| Error::Messages(e.to_string()))?
                .map(|message| message.map_err(|e| e.to_string()))
                .boxed()),
        }
    }
}

/// Event streams over NATS `JetStream`.
#[derive(Clone, Debug)]
pub struct JetStreamEvents {
    client: Client,
    jetstream: JetStreamContext,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    trace: TraceBridge,
}

impl JetStreamEvents {
    /// Connects to the server.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connect` if the server cannot be reached.
    pub async fn connect(
        JetStreamEventsOptions {
            url,
            name,
            username,
            password,
            trace,
        }: JetStreamEventsOptions,
    ) -> Result<Self, Error> {
        let mut options = ConnectOptions::new()
            .name(name.unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string()))
            .max_reconnects(MAX_RECONNECTS)
            .reconnect_delay_callback(|_| RECONNECT_DELAY);

        if let (Some(username), Some(password)) = (username, password) {
            options = options.user_and_password(username, password);
        }

        info!(url = %url, "connecting to NATS");

        let client = options
            .connect(url.as_str())
            .await
            .map_err(|e| Error::Connect(e.kind()))?;

        info!("connected to NATS JetStream");

        Ok(Self::new(client, trace))
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn new(client: Client, trace: TraceBridge) -> Self {
        let jetstream = jetstream::new(client.clone());

        Self {
            client,
            jetstream,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            trace,
        }
    }

    /// The underlying client.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Whether [`EventStream::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        Ok(())
    }

    async fn get_stream(&self, stream: &str) -> Result<Stream, Error> {
        self.jetstream
            .get_stream(stream)
            .await
            .map_err(|e| Error::GetStream(e.kind()))
    }

    async fn ensure_consumer(
        &self,
        stream: &str,
        name: &str,
        config: &ConsumerGroupConfig,
    ) -> Result<GroupConsumer, Error> {
        let stream = self.get_stream(stream).await?;

        match config.delivery_mode {
            DeliveryMode::PushWithGroup => {
                let deliver_subject = config
                    .deliver_subject
                    .clone()
                    .unwrap_or_else(|| self.client.new_inbox());

                stream
                    .get_or_create_consumer(
                        name,
                        consumer::push_config(name, deliver_subject, config),
                    )
                    .await
                    .map(GroupConsumer::Push)
                    .map_err(|e| Error::CreateConsumer(e.kind()))
            }
            DeliveryMode::Pull => stream
                .get_or_create_consumer(name, consumer::pull_config(name, config))
                .await
                .map(GroupConsumer::Pull)
                .map_err(|e| Error::CreateConsumer(e.kind())),
        }
    }

    /// Binds the durable `name` with the delivery mode it was created with.
    ///
    /// A consumer that has a deliver subject is bound push, any other pull.
    /// Only a missing consumer is created, from the push `defaults`.
    async fn bind_consumer(
        &self,
        stream: &str,
        name: &str,
        defaults: &ConsumerGroupConfig,
    ) -> Result<GroupConsumer, Error> {
        let stream = self.get_stream(stream).await?;
        let deliver_subject = defaults
            .deliver_subject
            .clone()
            .unwrap_or_else(|| self.client.new_inbox());

        let existing = stream
            .get_or_create_consumer(
                name,
                consumer::push_config(name, deliver_subject, defaults).into_consumer_config(),
            )
            .await
            .map_err(|e| Error::CreateConsumer(e.kind()))?;

        let bound = if existing.cached_info().config.deliver_subject.is_some() {
            stream
                .get_consumer::<push::Config>(name)
                .await
                .map(GroupConsumer::Push)
        } else {
            debug!(group = name, "binding pull consumer");
            stream
                .get_consumer::<pull::Config>(name)
                .await
                .map(GroupConsumer::Pull)
        };

        bound.map_err(|e| Error::GetConsumer(e.to_string()))
    }

    async fn start_delivery<H>(
        &self,
        topic: &str,
        stream: &str,
        group: &str,
        config: &ConsumerGroupConfig,
        mode: Mode,
        handler: H,
    ) -> Result<(), Error>
    where
        H: EventHandler,
    {
        let consumer = self.bind_consumer(stream, group, config).await?;
        let (policy, target) = consumer::delivery_settings(&consumer.info().config);
        let messages = consumer.messages().await?;

        let delivery = Delivery {
            dead_letter_target: target,
            group: group.to_string(),
            jetstream: self.jetstream.clone(),
            mode,
            policy,
            shutdown_token: self.shutdown_token.clone(),
            topic: topic.to_string(),
            trace: self.trace.clone(),
        };

        let span = info_span!("delivery", topic, stream, group);
        let handle = self
            .task_tracker
            .spawn(delivery.run(messages, handler).instrument(span));
        self.tasks.lock().push(handle);

        Ok(())
    }

    async fn stream_for(&self, subject: &str) -> Result<String, Error> {
        self.jetstream
            .stream_by_subject(subject)
            .await
            .map_err(|e| Error::StreamBySubject(e.kind()))
    }
}

#[async_trait]
impl EventStream for JetStreamEvents {
    type Error = Error;

    #[instrument(skip(self, cx, event), fields(event_id = %event.id()))]
    async fn publish_with_context(
        &self,
        cx: &Context,
        topic: &str,
        event: &Event,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        require_non_empty(topic, "topic")?;
        event.validate()?;

        let payload = event.to_bytes()?;

        let ack = match self.trace.inject(cx) {
            Some(carrier) => {
                self.jetstream
                    .publish_with_headers(topic.to_string(), headers_from_carrier(&carrier), payload)
                    .await
            }
            None => self.jetstream.publish(topic.to_string(), payload).await,
        }
        .map_err(|e| Error::Publish(e.kind()))?
        .await
        .map_err(|e| Error::Publish(e.kind()))?;

        debug!(topic, stream = %ack.stream, sequence = ack.sequence, "published event");

        Ok(())
    }

    #[instrument(skip(self, handler))]
    async fn subscribe<H>(&self, topic: &str, group: &str, handler: H) -> Result<(), Error>
    where
        H: EventHandler,
    {
        require_non_empty(group, "group")?;
        require_non_empty(topic, "topic")?;
        self.ensure_open()?;

        let stream = self.stream_for(topic).await?;
        let config = ConsumerGroupConfig::for_group(group).with_filter_subject(topic);

        self.start_delivery(topic, &stream, group, &config, Mode::Group, handler)
            .await?;

        info!(topic, stream = %stream, group, "subscribed to subject");

        Ok(())
    }

    #[instrument(skip(self, handler))]
    async fn subscribe_dead_letter<H>(&self, topic: &str, handler: H) -> Result<(), Error>
    where
        H: EventHandler,
    {
        require_non_empty(topic, "topic")?;
        self.ensure_open()?;

        let stream = self.stream_for(topic).await?;
        let group = consumer::dead_letter_consumer_name(topic);
        let config = ConsumerGroupConfig::for_group(group.clone())
            .with_filter_subject(topic)
            .with_max_deliver(1);

        self.start_delivery(topic, &stream, &group, &config, Mode::DeadLetter, handler)
            .await?;

        info!(topic, stream = %stream, group = %group, "subscribed to dead-letter subject");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_stream(&self, name: &str, subjects: &[String]) -> Result<(), Error> {
        require_non_empty(name, "stream")?;
        self.ensure_open()?;

        self.jetstream
            .get_or_create_stream(StreamConfig {
                name: name.to_string(),
                subjects: subjects.to_vec(),
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::CreateStream(e.kind()))?;

        info!(stream = name, ?subjects, "stream ready");

        Ok(())
    }

    #[instrument(skip(self, config))]
    async fn create_consumer_group(
        &self,
        stream: &str,
        name: &str,
        config: ConsumerGroupConfig,
    ) -> Result<(), Error> {
        require_non_empty(stream, "stream")?;
        require_non_empty(name, "group")?;
        self.ensure_open()?;
        config.validate()?;

        self.ensure_consumer(stream, name, &config).await?;

        info!(stream, group = name, "consumer group ready");

        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.shutdown_token.cancel();
        self.task_tracker.close();

        let handles = std::mem::take(&mut *self.tasks.lock());
        let mut failures = Vec::new();

        for handle in handles {
            if let Err(e) = handle.await {
                failures.push(e.to_string());
            }
        }

        self.task_tracker.wait().await;

        if let Err(e) = self.client.flush().await {
            failures.push(format!("failed to flush: {}", e.kind()));
        }

        if failures.is_empty() {
            info!("closed JetStream event streams");
            Ok(())
        } else {
            Err(Error::Close { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ebrick_events::{ErrorKind, EventContext, StreamError, handler_fn};
    use serial_test::serial;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const NATS_URL: &str = "nats://localhost:4222";

    #[derive(Debug, thiserror::Error)]
    #[error("handler failed")]
    struct HandlerFailed;

    async fn offline() -> JetStreamEvents {
        let client = ConnectOptions::new()
            .retry_on_initial_connect()
            .connect("nats://127.0.0.1:1")
            .await
            .unwrap();

        JetStreamEvents::new(client, TraceBridge::disabled())
    }

    async fn online() -> JetStreamEvents {
        JetStreamEvents::connect(JetStreamEventsOptions {
            url: NATS_URL.to_string(),
            ..JetStreamEventsOptions::default()
        })
        .await
        .unwrap()
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
    }

    #[tokio::test]
    async fn test_empty_group_is_rejected_before_network() {
        let events = offline().await;
        let handler = handler_fn(|_event: Event, _context: EventContext| async {
            Ok::<(), HandlerFailed>(())
        });

        let result = events.subscribe("orders.created", "", handler).await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_invalid_event_is_rejected_before_network() {
        let events = offline().await;
        let event = Event::binary("test", "", None, "payload");

        let result = events.publish("orders.created", &event).await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    #[serial]
    #[ignore = "Requires NATS server"]
    async fn test_publish_and_subscribe() {
        let events = online().await;
        let stream = unique("ORDERS");
        let subject = format!("{stream}.created");

        events
            .create_stream(&stream, &[format!("{stream}.>")])
            .await
            .unwrap();
        events
            .create_stream(&stream, &[format!("{stream}.>")])
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
        events.subscribe(&subject, "billing", handler).await.unwrap();

        let event = Event::new("test", "order.created", &"payload")
            .unwrap()
            .with_id("e1");
        events.publish(&subject, &event).await.unwrap();

        let received = timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "e1");

        events.close().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "Requires NATS server"]
    async fn test_exhausted_message_is_dead_lettered() {
        let events = online().await;
        let stream = unique("ORDERS");
        let subject = format!("{stream}.created");
        let dead_letter_subject = format!("{stream}.dlq");

        events
            .create_stream(&stream, &[format!("{stream}.>")])
            .await
            .unwrap();
        events
            .create_consumer_group(
                &stream,
                "billing",
                ConsumerGroupConfig::for_group("billing")
                    .with_filter_subject(subject.clone())
                    .with_ack_wait(Duration::from_millis(500))
                    .with_backoff(vec![Duration::from_millis(50)])
                    .with_dead_letter_target(dead_letter_subject.clone()),
            )
            .await
            .unwrap();

        let failing = handler_fn(|_event: Event, _context: EventContext| async {
            Err::<(), HandlerFailed>(HandlerFailed)
        });
        events.subscribe(&subject, "billing", failing).await.unwrap();

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let dead_letters = handler_fn(move |event: Event, _context: EventContext| {
            let sender = sender.clone();
            async move {
                let _ = sender.send(event.id().to_string());
                Ok::<(), HandlerFailed>(())
            }
        });
        events
            .subscribe_dead_letter(&dead_letter_subject, dead_letters)
            .await
            .unwrap();

        let event = Event::new("test", "order.created", &"payload")
            .unwrap()
            .with_id("e1");
        events.publish(&subject, &event).await.unwrap();

        let received = timeout(Duration::from_secs(10), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "e1");

        events.close().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "Requires NATS server"]
    async fn test_subscribe_binds_existing_pull_group() {
        let events = online().await;
        let stream = unique("ORDERS");
        let subject = format!("{stream}.created");

        events
            .create_stream(&stream, &[format!("{stream}.>")])
            .await
            .unwrap();
        events
            .create_consumer_group(
                &stream,
                "billing",
                ConsumerGroupConfig::for_group("billing")
                    .with_filter_subject(subject.clone())
                    .with_delivery_mode(DeliveryMode::Pull),
            )
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
        events.subscribe(&subject, "billing", handler).await.unwrap();

        let event = Event::new("test", "order.created", &"payload")
            .unwrap()
            .with_id("e1");
        events.publish(&subject, &event).await.unwrap();

        let received = timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "e1");

        events.close().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "Requires NATS server"]
    async fn test_subscribe_without_stream_fails() {
        let events = online().await;

        let handler = handler_fn(|_event: Event, _context: EventContext| async {
            Ok::<(), HandlerFailed>(())
        });
        let result = events
            .subscribe(&unique("missing"), "billing", handler)
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Transport);
        events.close().await.unwrap();
    }
}
