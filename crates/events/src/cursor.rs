use crate::StartCursor;

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Field holding the encoded envelope of a cursor entry.
pub const EVENT_FIELD: &str = "event";

/// Field holding the JSON trace carrier of a cursor entry, when traced.
pub const TRACE_FIELD: &str = "trace";

/// Marker trait for cursor backend errors
pub trait CursorBackendError: StdError + Send + Sync + 'static {}

/// One entry read from a group cursor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CursorEntry {
    /// Backend-assigned entry id.
    pub id: String,

    /// Field/value pairs of the entry.
    pub fields: HashMap<String, Bytes>,
}

impl CursorEntry {
    /// A single field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Bytes> {
        self.fields.get(name)
    }
}

/// Result of a group-create command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GroupCreation {
    /// The group was created.
    Created,

    /// The group existed already; nothing changed.
    AlreadyExists,
}

/// A stream broker addressed through group-cursor commands.
///
/// The broker keeps one cursor and one pending list per group but no retry
/// bookkeeping. Handles are cheap to clone and safe for concurrent use;
/// blocking reads go through a dedicated [`CursorReader`].
#[async_trait]
pub trait CursorBackend
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the backend.
    type Error: CursorBackendError;

    /// The reader type for the backend.
    type Reader: CursorReader<Error = Self::Error>;

    /// Creates `group` on `stream` at `start`, creating the stream if needed.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: &StartCursor,
    ) -> Result<GroupCreation, Self::Error>;

    /// Appends an entry and returns its id.
    async fn append(&self, stream: &str, fields: Vec<(String, Bytes)>)
    -> Result<String, Self::Error>;

    /// Acknowledges entry `id` for `group`, removing it from the pending list.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), Self::Error>;

    /// Opens a reader for one delivery loop.
    async fn reader(&self) -> Result<Self::Reader, Self::Error>;
}

/// Blocking reads for one delivery loop.
#[async_trait]
pub trait CursorReader
where
    Self: Send + 'static,
{
    /// The error type for the reader.
    type Error: CursorBackendError;

    /// Reads up to `count` entries never delivered to `group`, waiting at
    /// most `block` for one to arrive. Read entries become pending for
    /// `consumer`.
    async fn read_new(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<CursorEntry>, Self::Error>;

    /// Transfers up to `count` entries pending for longer than `min_idle`
    /// (in any member of `group`) to `consumer`.
    async fn claim_stale(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<CursorEntry>, Self::Error>;
}
