use ebrick_events::cursor::CursorBackendError;
use thiserror::Error;

/// Error type for in-memory cursor operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The start cursor does not name an entry position.
    #[error("invalid cursor position `{0}`")]
    InvalidCursor(String),

    /// The group was never created on the stream.
    #[error("no group `{group}` on stream `{stream}`")]
    NoGroup {
        /// Stream the read targeted.
        stream: String,
        /// Missing group.
        group: String,
    },

    /// Appends to the stream were disabled with `reject_appends_to`.
    #[error("appends to stream `{0}` are rejected")]
    Rejected(String),
}

impl CursorBackendError for Error {}
