use std::ops::ControlFlow;
use std::time::Duration;

use bytes::Bytes;
use ebrick_events::cursor::{CursorBackend, CursorEntry, CursorReader, EVENT_FIELD, TRACE_FIELD};
use ebrick_events::{
    Carrier, Event, EventContext, EventHandler, RetryDecision, RetryPolicy, TraceBridge,
};
use opentelemetry::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Entries requested per poll; delivery is strictly one at a time.
const READ_COUNT: usize = 1;

/// Stale entries transferred per claim.
const CLAIM_COUNT: usize = 10;

/// Pause after a failed poll before polling again.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// How a delivery loop treats handler failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Retry under the group's policy, then dead-letter.
    Group,

    /// Deliver once; failures are logged and acknowledged.
    DeadLetter,
}

/// One consumer-group member reading a single topic.
#[derive(Debug)]
pub struct Delivery<B>
where
    B: CursorBackend,
{
    pub backend: B,
    pub claim_idle: Duration,
    pub consumer: String,
    pub dead_letter_target: Option<String>,
    pub group: String,
    pub mode: Mode,
    pub poll_timeout: Duration,
    pub policy: RetryPolicy,
    pub shutdown_token: CancellationToken,
    pub topic: String,
    pub trace: TraceBridge,
}

impl<B> Delivery<B>
where
    B: CursorBackend,
{
    /// Polls and processes entries until the shutdown token fires.
    pub async fn run<H>(self, mut reader: B::Reader, handler: H)
    where
        H: EventHandler,
    {
        debug!(
            topic = %self.topic,
            group = %self.group,
            consumer = %self.consumer,
            "delivery loop started"
        );

        'delivery: loop {
            let read = tokio::select! {
                () = self.shutdown_token.cancelled() => break,
                read = reader.read_new(
                    &self.topic,
                    &self.group,
                    &self.consumer,
                    READ_COUNT,
                    self.poll_timeout,
                ) => read,
            };

            let entries = match read {
                Ok(entries) if entries.is_empty() => self.claim_stale(&mut reader).await,
                Ok(entries) => entries,
                Err(e) => {
                    error!(topic = %self.topic, group = %self.group, error = %e, "failed to read from stream");

                    tokio::select! {
                        () = self.shutdown_token.cancelled() => break,
                        () = tokio::time::sleep(READ_ERROR_BACKOFF) => continue,
                    }
                }
            };

            for entry in entries {
                if self.process(&handler, entry).await.is_break() {
                    break 'delivery;
                }
            }
        }

        debug!(
            topic = %self.topic,
            group = %self.group,
            consumer = %self.consumer,
            "delivery loop stopped"
        );
    }

    async fn claim_stale(&self, reader: &mut B::Reader) -> Vec<CursorEntry> {
        match reader
            .claim_stale(
                &self.topic,
                &self.group,
                &self.consumer,
                self.claim_idle,
                CLAIM_COUNT,
            )
            .await
        {
            Ok(entries) => {
                if !entries.is_empty() {
                    warn!(
                        topic = %self.topic,
                        group = %self.group,
                        count = entries.len(),
                        "recovered stale entries from another consumer"
                    );
                }
                entries
            }
            Err(e) => {
                warn!(topic = %self.topic, group = %self.group, error = %e, "failed to claim stale entries");
                Vec::new()
            }
        }
    }

    async fn process<H>(&self, handler: &H, entry: CursorEntry) -> ControlFlow<()>
    where
        H: EventHandler,
    {
        let decoded = entry
            .field(EVENT_FIELD)
            .map(|body| Event::from_bytes(body));

        let event = match decoded {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                error!(topic = %self.topic, entry_id = %entry.id, error = %e, "failed to decode event");
                self.dead_letter(&entry).await;
                self.ack(&entry.id).await;
                return ControlFlow::Continue(());
            }
            None => {
                error!(topic = %self.topic, entry_id = %entry.id, "entry has no event field");
                self.dead_letter(&entry).await;
                self.ack(&entry.id).await;
                return ControlFlow::Continue(());
            }
        };

        let cx = self.extract_trace(&entry);

        let mut attempt = 1;
        loop {
            let context =
                EventContext::new(self.topic.clone(), cx.clone(), self.shutdown_token.clone());

            let Err(e) = handler.handle(event.clone(), context).await else {
                self.ack(&entry.id).await;
                return ControlFlow::Continue(());
            };

            if self.mode == Mode::DeadLetter {
                error!(
                    topic = %self.topic,
                    entry_id = %entry.id,
                    event_id = %event.id(),
                    error = %e,
                    "failed to process dead-lettered event"
                );
                self.ack(&entry.id).await;
                return ControlFlow::Continue(());
            }

            match self.policy.decide(attempt) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        topic = %self.topic,
                        group = %self.group,
                        entry_id = %entry.id,
                        attempt,
                        ?delay,
                        error = %e,
                        "processing failed, retrying"
                    );

                    tokio::select! {
                        // Left pending; another member claims it once idle.
                        () = self.shutdown_token.cancelled() => return ControlFlow::Break(()),
                        () = tokio::time::sleep(delay) => {}
                    }

                    attempt += 1;
                }
                RetryDecision::Exhausted => {
                    error!(
                        topic = %self.topic,
                        group = %self.group,
                        entry_id = %entry.id,
                        attempt,
                        error = %e,
                        "max retries exceeded"
                    );
                    self.dead_letter(&entry).await;
                    self.ack(&entry.id).await;
                    return ControlFlow::Continue(());
                }
            }
        }
    }

    fn extract_trace(&self, entry: &CursorEntry) -> Context {
        if !self.trace.is_enabled() {
            return Context::new();
        }

        let carrier = entry.field(TRACE_FIELD).and_then(|raw| {
            serde_json::from_slice::<Carrier>(raw)
                .inspect_err(|e| {
                    warn!(entry_id = %entry.id, error = %e, "failed to decode trace carrier");
                })
                .ok()
        });

        self.trace.extract(carrier.as_ref())
    }

    async fn dead_letter(&self, entry: &CursorEntry) {
        let Some(target) = &self.dead_letter_target else {
            if self.mode == Mode::Group {
                warn!(
                    topic = %self.topic,
                    group = %self.group,
                    entry_id = %entry.id,
                    "no dead-letter target configured, dropping entry"
                );
            }
            return;
        };

        let fields: Vec<(String, Bytes)> = entry
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        match self.backend.append(target, fields).await {
            Ok(id) => {
                debug!(topic = %self.topic, entry_id = %entry.id, dead_letter_id = %id, target = %target, "forwarded entry to dead-letter target");
            }
            Err(e) => {
                error!(topic = %self.topic, entry_id = %entry.id, target = %target, error = %e, "failed to forward entry to dead-letter target");
            }
        }
    }

    async fn ack(&self, id: &str) {
        if let Err(e) = self.backend.ack(&self.topic, &self.group, id).await {
            error!(topic = %self.topic, group = %self.group, entry_id = %id, error = %e, "failed to acknowledge entry");
        }
    }
}
