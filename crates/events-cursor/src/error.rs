use ebrick_events::cursor::CursorBackendError;
use ebrick_events::{ErrorKind, StreamError};
use thiserror::Error;

/// Error type for group-cursor event streams.
#[derive(Debug, Error)]
pub enum Error<BE>
where
    BE: CursorBackendError,
{
    /// The backend rejected a command or could not be reached.
    #[error("cursor backend error: {0}")]
    Backend(#[source] BE),

    /// One or more delivery tasks did not stop cleanly.
    #[error("failed to stop {} delivery task(s): {}", failures.len(), failures.join("; "))]
    Close {
        /// One message per failed task.
        failures: Vec<String>,
    },

    /// The stream was closed.
    #[error("event stream is closed")]
    Closed,

    /// An event could not be validated, encoded or decoded.
    #[error(transparent)]
    Event(#[from] ebrick_events::Error),

    /// The trace carrier could not be encoded.
    #[error("failed to encode trace carrier: {0}")]
    TraceCarrier(#[source] serde_json::Error),
}

impl<BE> StreamError for Error<BE>
where
    BE: CursorBackendError,
{
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Backend(_) | Self::Close { .. } | Self::Closed => ErrorKind::Transport,
            Self::Event(e) => e.kind(),
            Self::TraceCarrier(_) => ErrorKind::Serialization,
        }
    }
}
