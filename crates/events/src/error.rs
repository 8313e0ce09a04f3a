use std::error::Error as StdError;

use thiserror::Error;

/// The error categories visible to callers of an event stream.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// Unsupported backend kind or missing connection parameter.
    Configuration,

    /// Connection lost, broker unreachable or broker rejection.
    Transport,

    /// An envelope could not be encoded or decoded.
    Serialization,

    /// A caller-supplied argument was rejected before any network call.
    InvalidArgument,
}

/// Marker trait for event stream errors.
pub trait StreamError: StdError + Send + Sync + 'static {
    /// The category this error falls into.
    fn kind(&self) -> ErrorKind;
}

/// Errors raised by the envelope and configuration types of this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Base64 payload could not be decoded.
    #[error("invalid data_base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Envelope JSON could not be decoded.
    #[error("failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),

    /// Envelope or payload could not be encoded.
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A required envelope attribute was absent on the wire.
    #[error("event is missing required attribute `{0}`")]
    MissingAttribute(&'static str),

    /// The envelope declares a spec version this crate does not read.
    #[error("unsupported specversion `{0}`")]
    UnsupportedSpecVersion(String),
}

/// Rejects a blank topic, group or stream name before any network call.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] naming `what` when `value` is empty or
/// whitespace.
pub fn require_non_empty(value: &str, what: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::InvalidArgument(format!("{what} cannot be empty")));
    }

    Ok(())
}

impl StreamError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Base64(_)
            | Self::Decode(_)
            | Self::Encode(_)
            | Self::MissingAttribute(_)
            | Self::UnsupportedSpecVersion(_) => ErrorKind::Serialization,
        }
    }
}
