use crate::headers::carrier_from_headers;

use async_nats::jetstream::{self, AckKind};
use ebrick_events::{Event, EventContext, EventHandler, RetryDecision, RetryPolicy, TraceBridge};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Messages pushed or pulled for one consumer, receive errors stringified.
pub type MessageStream = BoxStream<'static, Result<jetstream::Message, String>>;

/// How a delivery loop treats handler failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Nak under the group's policy, then dead-letter.
    Group,

    /// Deliver once; failures are logged and terminated.
    DeadLetter,
}

/// One member of a durable consumer.
#[derive(Debug)]
pub struct Delivery {
    pub dead_letter_target: Option<String>,
    pub group: String,
    pub jetstream: jetstream::Context,
    pub mode: Mode,
    pub policy: RetryPolicy,
    pub shutdown_token: CancellationToken,
    pub topic: String,
    pub trace: TraceBridge,
}

impl Delivery {
    /// Handles messages until the shutdown token fires or the stream ends.
    pub async fn run<H>(self, mut messages: MessageStream, handler: H)
    where
        H: EventHandler,
    {
        debug!(topic = %self.topic, group = %self.group, "delivery loop started");

        loop {
            let next = tokio::select! {
                () = self.shutdown_token.cancelled() => break,
                next = messages.next() => next,
            };

            match next {
                Some(Ok(message)) => self.process(&handler, message).await,
                Some(Err(e)) => {
                    warn!(topic = %self.topic, group = %self.group, error = %e, "failed to receive message");
                }
                None => {
                    warn!(topic = %self.topic, group = %self.group, "message stream ended");
                    break;
                }
            }
        }

        debug!(topic = %self.topic, group = %self.group, "delivery loop stopped");
    }

    async fn process<H>(&self, handler: &H, message: jetstream::Message)
    where
        H: EventHandler,
    {
        let attempt = message
            .info()
            .ok()
            .and_then(|info| u32::try_from(info.delivered).ok())
            .unwrap_or(1)
            .max(1);

        let event = match Event::from_bytes(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                error!(subject = %message.subject, attempt, error = %e, "failed to decode event");
                self.reject(&message, attempt).await;
                return;
            }
        };

        let cx = if self.trace.is_enabled() {
            self.trace
                .extract(carrier_from_headers(message.headers.as_ref()).as_ref())
        } else {
            opentelemetry::Context::new()
        };
        let context = EventContext::new(self.topic.clone(), cx, self.shutdown_token.clone());
        let event_id = event.id().to_string();

        match handler.handle(event, context).await {
            Ok(()) => {
                if let Err(e) = message.ack().await {
                    error!(event_id = %event_id, error = %e, "failed to acknowledge message");
                }
            }
            Err(e) if self.mode == Mode::DeadLetter => {
                error!(event_id = %event_id, error = %e, "failed to process dead-lettered event");
                self.reject(&message, attempt).await;
            }
            Err(e) => {
                warn!(
                    topic = %self.topic,
                    group = %self.group,
                    event_id = %event_id,
                    attempt,
                    error = %e,
                    "processing failed"
                );
                self.reject(&message, attempt).await;
            }
        }
    }

    async fn reject(&self, message: &jetstream::Message, attempt: u32) {
        if self.mode == Mode::DeadLetter {
            self.ack_with(message, AckKind::Term).await;
            return;
        }

        match self.policy.decide(attempt) {
            RetryDecision::Retry(delay) => {
                self.ack_with(message, AckKind::Nak(Some(delay))).await;
            }
            RetryDecision::Exhausted => {
                error!(
                    topic = %self.topic,
                    group = %self.group,
                    attempt,
                    "max retries exceeded"
                );
                self.dead_letter(message).await;
                self.ack_with(message, AckKind::Term).await;
            }
        }
    }

    async fn dead_letter(&self, message: &jetstream::Message) {
        let Some(target) = &self.dead_letter_target else {
            warn!(
                topic = %self.topic,
                group = %self.group,
                "no dead-letter target configured, dropping message"
            );
            return;
        };

        let headers = message.headers.clone().unwrap_or_default();
        let published = match self
            .jetstream
            .publish_with_headers(target.clone(), headers, message.payload.clone())
            .await
        {
            Ok(ack) => ack.await.map(|_| ()),
            Err(e) => Err(e),
        };

        match published {
            Ok(()) => {
                debug!(topic = %self.topic, target = %target, "forwarded message to dead-letter target");
            }
            Err(e) => {
                error!(topic = %self.topic, target = %target, error = %e, "failed to forward message to dead-letter target");
            }
        }
    }

    async fn ack_with(&self, message: &jetstream::Message, kind: AckKind) {
        if let Err(e) = message.ack_with(kind).await {
            error!(topic = %self.topic, group = %self.group, error = %e, "failed to acknowledge message");
        }
    }
}
