//! Event streams over group-cursor brokers.
//!
//! The broker only tracks a cursor and a pending list per group, so retry
//! accounting happens here: every subscription runs one delivery task that
//! retries failed handlers in-process, forwards exhausted entries to the
//! group's dead-letter target and recovers entries left pending by dead
//! consumers.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod delivery;
mod error;

pub use error::Error;

use delivery::{Delivery, Mode};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use ebrick_events::cursor::{CursorBackend, EVENT_FIELD, GroupCreation, TRACE_FIELD};
use ebrick_events::{
    ConsumerGroupConfig, Event, EventHandler, EventStream, RetryPolicy, StartCursor, TraceBridge,
    generate_consumer_name, require_non_empty,
};
use opentelemetry::Context;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

/// How long a poll waits for a new entry before checking for stale ones.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Options for [`CursorEvents`].
#[derive(Clone, Debug)]
pub struct CursorEventsOptions {
    /// How long a poll waits for a new entry.
    pub poll_timeout: Duration,

    /// Trace propagation through the `trace` field of each entry.
    pub trace: TraceBridge,
}

impl Default for CursorEventsOptions {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            trace: TraceBridge::disabled(),
        }
    }
}

/// Event streams over a [`CursorBackend`].
#[derive(Clone, Debug)]
pub struct CursorEvents<B>
where
    B: CursorBackend,
{
    backend: B,
    // Keyed by (stream, group).
    configs: Arc<DashMap<(String, String), ConsumerGroupConfig>>,
    options: CursorEventsOptions,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<B> CursorEvents<B>
where
    B: CursorBackend,
{
    /// Creates event streams over `backend`.
    pub fn new(
        backend: B,
        CursorEventsOptions {
            poll_timeout,
            trace,
        }: CursorEventsOptions,
    ) -> Self {
        Self {
            backend,
            configs: Arc::new(DashMap::new()),
            options: CursorEventsOptions {
                poll_timeout,
                trace,
            },
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The underlying backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether [`EventStream::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    fn ensure_open(&self) -> Result<(), Error<B::Error>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        Ok(())
    }

    fn group_config(&self, stream: &str, group: &str) -> ConsumerGroupConfig {
        let key = (stream.to_string(), group.to_string());

        if let Some(config) = self.configs.get(&key) {
            return config.clone();
        }

        debug!(stream, group, "consumer group config not found, using defaults");
        ConsumerGroupConfig::for_group(group)
    }

    async fn start_delivery<H>(
        &self,
        topic: &str,
        group: &str,
        config: &ConsumerGroupConfig,
        mode: Mode,
        handler: H,
    ) -> Result<String, Error<B::Error>>
    where
        H: EventHandler,
    {
        let reader = self.backend.reader().await.map_err(Error::Backend)?;

        let policy = RetryPolicy::from(config);
        let consumer = generate_consumer_name(group);
        let delivery = Delivery {
            backend: self.backend.clone(),
            claim_idle: policy.retry_window() + config.ack_wait,
            consumer: consumer.clone(),
            dead_letter_target: config
                .has_dead_letter_target()
                .then(|| config.dead_letter_target.clone()),
            group: group.to_string(),
            mode,
            poll_timeout: self.options.poll_timeout,
            policy,
            shutdown_token: self.shutdown_token.clone(),
            topic: topic.to_string(),
            trace: self.options.trace.clone(),
        };

        let span = info_span!("delivery", topic, group, consumer = %consumer);
        let handle = self
            .task_tracker
            .spawn(delivery.run(reader, handler).instrument(span));
        self.tasks.lock().push(handle);

        Ok(consumer)
    }
}

#[async_trait]
impl<B> EventStream for CursorEvents<B>
where
    B: CursorBackend,
{
    type Error = Error<B::Error>;

    #[instrument(skip(self, cx, event), fields(event_id = %event.id()))]
    async fn publish_with_context(
        &self,
        cx: &Context,
        topic: &str,
        event: &Event,
    ) -> Result<(), Self::Error> {
        self.ensure_open()?;
        require_non_empty(topic, "topic")?;
        event.validate()?;

        let mut fields = vec![(EVENT_FIELD.to_string(), event.to_bytes()?)];

        if let Some(carrier) = self.options.trace.inject(cx) {
            let trace = serde_json::to_vec(&carrier).map_err(Error::TraceCarrier)?;
            fields.push((TRACE_FIELD.to_string(), Bytes::from(trace)));
        }

        let id = self
            .backend
            .append(topic, fields)
            .await
            .map_err(Error::Backend)?;

        debug!(topic, entry_id = %id, "published event");

        Ok(())
    }

    #[instrument(skip(self, handler))]
    async fn subscribe<H>(&self, topic: &str, group: &str, handler: H) -> Result<(), Self::Error>
    where
        H: EventHandler,
    {
        require_non_empty(group, "group")?;
        require_non_empty(topic, "topic")?;
        self.ensure_open()?;

        let config = self.group_config(topic, group);
        self.create_consumer_group(topic, group, config.clone())
            .await?;

        let consumer = self
            .start_delivery(topic, group, &config, Mode::Group, handler)
            .await?;

        info!(topic, group, consumer = %consumer, "subscribed to stream");

        Ok(())
    }

    #[instrument(skip(self, handler))]
    async fn subscribe_dead_letter<H>(&self, topic: &str, handler: H) -> Result<(), Self::Error>
    where
        H: EventHandler,
    {
        require_non_empty(topic, "topic")?;
        self.ensure_open()?;

        let group = format!("{topic}-dlq-group");
        let config = ConsumerGroupConfig::for_group(group.clone())
            .with_max_deliver(1)
            .with_start_cursor(StartCursor::Beginning);

        self.create_consumer_group(topic, &group, config.clone())
            .await?;

        let consumer = self
            .start_delivery(topic, &group, &config, Mode::DeadLetter, handler)
            .await?;

        info!(topic, group = %group, consumer = %consumer, "subscribed to dead-letter stream");

        Ok(())
    }

    async fn create_stream(&self, name: &str, subjects: &[String]) -> Result<(), Self::Error> {
        warn!(
            stream = name,
            ?subjects,
            "group-cursor streams are created by the first group or publish, skipping"
        );

        Ok(())
    }

    #[instrument(skip(self, config))]
    async fn create_consumer_group(
        &self,
        stream: &str,
        name: &str,
        mut config: ConsumerGroupConfig,
    ) -> Result<(), Self::Error> {
        require_non_empty(stream, "stream")?;
        require_non_empty(name, "group")?;
        self.ensure_open()?;

        if config.group_name.is_empty() {
            config.group_name = name.to_string();
        }
        config.validate()?;

        let creation = self
            .backend
            .create_group(stream, name, &config.start_cursor)
            .await
            .map_err(Error::Backend)?;

        match creation {
            GroupCreation::Created => info!(stream, group = name, "created consumer group"),
            GroupCreation::AlreadyExists => {
                debug!(stream, group = name, "consumer group already exists");
            }
        }

        self.configs
            .entry((stream.to_string(), name.to_string()))
            .or_insert(config);

        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
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

        if failures.is_empty() {
            info!("closed group-cursor event streams");
            Ok(())
        } else {
            Err(Error::Close { failures })
        }
    }
}
