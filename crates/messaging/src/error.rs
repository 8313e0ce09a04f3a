use std::path::PathBuf;

use ebrick_events::{ErrorKind, StreamError};
use ebrick_events_redis::Error as RedisError;
use thiserror::Error;

/// Errors raised by the event stream façade.
#[derive(Debug, Error)]
pub enum Error {
    /// Unsupported backend or missing connection parameter.
    #[error("invalid messaging configuration: {0}")]
    Configuration(String),

    /// Error from the group-cursor driver.
    #[error(transparent)]
    Cursor(#[from] ebrick_events_cursor::Error<RedisError>),

    /// Error from the log-stream driver.
    #[error(transparent)]
    Nats(#[from] ebrick_events_nats::Error),

    /// The configuration file could not be parsed.
    #[error("failed to parse config: {0}")]
    ParseConfig(#[from] toml::de::Error),

    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ReadConfig {
        /// The file that was read.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Error connecting the Redis backend.
    #[error(transparent)]
    Redis(#[from] RedisError),
}

impl StreamError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::ParseConfig(_) | Self::ReadConfig { .. } => {
                ErrorKind::Configuration
            }
            Self::Cursor(e) => e.kind(),
            Self::Nats(e) => e.kind(),
            Self::Redis(e) => e.kind(),
        }
    }
}
