use async_nats::ConnectErrorKind;
use async_nats::jetstream::context::{
    CreateStreamErrorKind, GetStreamByNameErrorKind, GetStreamErrorKind, PublishErrorKind,
};
use async_nats::jetstream::stream::ConsumerErrorKind;
use ebrick_events::{ErrorKind, StreamError};
use thiserror::Error;

/// Errors that can occur in `JetStream` event streams.
#[derive(Debug, Error)]
pub enum Error {
    /// One or more delivery tasks did not stop cleanly, or the final flush failed.
    #[error("failed to close event streams: {}", failures.join("; "))]
    Close {
        /// One message per failure.
        failures: Vec<String>,
    },

    /// The event streams were closed.
    #[error("event stream is closed")]
    Closed,

    /// Could not connect to the server.
    #[error("failed to connect to NATS: {0}")]
    Connect(ConnectErrorKind),

    /// Consumer create error.
    #[error("failed to create consumer: {0}")]
    CreateConsumer(ConsumerErrorKind),

    /// Stream create error.
    #[error("failed to create stream: {0}")]
    CreateStream(CreateStreamErrorKind),

    /// An event could not be validated, encoded or decoded.
    #[error(transparent)]
    Event(#[from] ebrick_events::Error),

    /// An existing consumer could not be bound.
    #[error("failed to get consumer: {0}")]
    GetConsumer(String),

    /// Stream lookup error.
    #[error("failed to get stream: {0}")]
    GetStream(GetStreamErrorKind),

    /// Consumer messages error.
    #[error("failed to get consumer messages: {0}")]
    Messages(String),

    /// Publish error.
    #[error("failed to publish: {0}")]
    Publish(PublishErrorKind),

    /// No stream captures the subject.
    #[error("no stream found for subject: {0}")]
    StreamBySubject(GetStreamByNameErrorKind),
}

impl StreamError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Event(e) => e.kind(),
            Self::Close { .. }
            | Self::Closed
            | Self::Connect(_)
            | Self::CreateConsumer(_)
            | Self::CreateStream(_)
            | Self::GetConsumer(_)
            | Self::GetStream(_)
            | Self::Messages(_)
            | Self::Publish(_)
            | Self::StreamBySubject(_) => ErrorKind::Transport,
        }
    }
}

