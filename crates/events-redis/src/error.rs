use ebrick_events::cursor::CursorBackendError;
use ebrick_events::{ErrorKind, StreamError};
use thiserror::Error;

/// Error type for Redis cursor operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Could not connect to the server.
    #[error("failed to connect to redis: {0}")]
    Connect(#[source] redis::RedisError),

    /// The connection URL could not be parsed.
    #[error("invalid redis url: {0}")]
    InvalidUrl(#[source] redis::RedisError),

    /// A command failed.
    #[error("redis command `{command}` failed: {source}")]
    Command {
        /// The command that failed.
        command: &'static str,
        /// The underlying error.
        source: redis::RedisError,
    },

    /// The server replied with an unexpected shape.
    #[error("unexpected reply to `{command}`: {reason}")]
    Reply {
        /// The command that was answered.
        command: &'static str,
        /// What was wrong with the reply.
        reason: String,
    },
}

impl Error {
    pub(crate) fn command(command: &'static str) -> impl FnOnce(redis::RedisError) -> Self {
        move |source| Self::Command { command, source }
    }
}

impl CursorBackendError for Error {}

impl StreamError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUrl(_) => ErrorKind::Configuration,
            Self::Connect(_) | Self::Command { .. } | Self::Reply { .. } => ErrorKind::Transport,
        }
    }
}
