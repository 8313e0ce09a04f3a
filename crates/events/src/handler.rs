use crate::Event;

use std::error::Error as StdError;
use std::fmt::{self, Debug};
use std::future::Future;

use async_trait::async_trait;
use opentelemetry::Context;
use tokio_util::sync::CancellationToken;

/// Per-delivery context handed to an [`EventHandler`].
#[derive(Clone, Debug)]
pub struct EventContext {
    cancellation: CancellationToken,
    topic: String,
    trace: Context,
}

impl EventContext {
    /// Creates a context for a delivery on `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>, trace: Context, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            topic: topic.into(),
            trace,
        }
    }

    /// The topic the event was delivered on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Trace context extracted from the message, empty when tracing is off.
    #[must_use]
    pub const fn trace(&self) -> &Context {
        &self.trace
    }

    /// Fires when the owning stream is closing.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the owning stream is closing.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Processes events delivered to a subscription.
///
/// An error asks for redelivery under the group's retry policy.
#[async_trait]
pub trait EventHandler
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the handler.
    type Error: StdError + Send + Sync + 'static;

    /// Handles one delivery.
    async fn handle(&self, event: Event, context: EventContext) -> Result<(), Self::Error>;
}

/// Handler built from an async closure, see [`handler_fn`].
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

impl<F> Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Wraps an async closure as an [`EventHandler`].
pub const fn handler_fn<F, Fut, E>(f: F) -> FnHandler<F>
where
    F: Fn(Event, EventContext) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut, E> EventHandler for FnHandler<F>
where
    F: Fn(Event, EventContext) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    type Error = E;

    async fn handle(&self, event: Event, context: EventContext) -> Result<(), E> {
        (self.f)(event, context).await
    }
}
