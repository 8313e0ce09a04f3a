//! In-memory group-cursor backend, used to run the cursor driver without a
//! broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ebrick_events::StartCursor;
use ebrick_events::cursor::{CursorBackend, CursorEntry, CursorReader, GroupCreation};
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, timeout_at};
use tracing::debug;

#[derive(Clone, Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    next_index: usize,
    // Keyed by entry index so claims come back in stream order.
    pending: BTreeMap<usize, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<CursorEntry>,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn position_after(&self, cursor: &StartCursor) -> Result<usize, Error> {
        match cursor {
            StartCursor::Beginning => Ok(0),
            StartCursor::New => Ok(self.entries.len()),
            StartCursor::Id(id) => {
                let target = sequence(id).ok_or_else(|| Error::InvalidCursor(id.clone()))?;

                Ok(self
                    .entries
                    .iter()
                    .position(|entry| sequence(&entry.id).is_some_and(|seq| seq > target))
                    .unwrap_or(self.entries.len()))
            }
        }
    }
}

#[derive(Debug, Default)]
struct State {
    rejected: HashSet<String>,
    streams: HashMap<String, StreamState>,
}

fn sequence(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

/// Group-cursor backend holding every stream in process memory.
///
/// Clones share state, so a test can keep a handle to inspect streams while
/// the driver owns another.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    appended: Arc<Notify>,
    operations: Arc<AtomicU64>,
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of backend commands issued so far.
    #[must_use]
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Makes every later append to `stream` fail.
    pub async fn reject_appends_to(&self, stream: impl Into<String>) {
        self.state.lock().await.rejected.insert(stream.into());
    }

    /// All entries of `stream`, oldest first.
    pub async fn entries(&self, stream: &str) -> Vec<CursorEntry> {
        self.state
            .lock()
            .await
            .streams
            .get(stream)
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    /// Number of entries delivered to `group` and not yet acknowledged.
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.state
            .lock()
            .await
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Group member currently holding entry `id`, if it is pending.
    pub async fn pending_consumer(&self, stream: &str, group: &str, id: &str) -> Option<String> {
        let state = self.state.lock().await;
        let stream_state = state.streams.get(stream)?;
        let index = stream_state.entries.iter().position(|e| e.id == id)?;

        stream_state
            .groups
            .get(group)?
            .pending
            .get(&index)
            .map(|p| p.consumer.clone())
    }

    /// Names of the groups created on `stream`.
    pub async fn groups(&self, stream: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut groups: Vec<String> = state
            .streams
            .get(stream)
            .map(|s| s.groups.keys().cloned().collect())
            .unwrap_or_default();
        drop(state);

        groups.sort();
        groups
    }

    fn record_operation(&self) {
        self.operations.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CursorBackend for MemoryBackend {
    type Error = Error;
    type Reader = MemoryReader;

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: &StartCursor,
    ) -> Result<GroupCreation, Error> {
        self.record_operation();

        let mut state = self.state.lock().await;
        let stream_state = state.streams.entry(stream.to_string()).or_default();

        if stream_state.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }

        let next_index = stream_state.position_after(start)?;
        stream_state.groups.insert(
            group.to_string(),
            GroupState {
                next_index,
                pending: BTreeMap::new(),
            },
        );
        drop(state);

        debug!(stream, group, %start, "created consumer group");

        Ok(GroupCreation::Created)
    }

    async fn append(&self, stream: &str, fields: Vec<(String, Bytes)>) -> Result<String, Error> {
        self.record_operation();

        let mut state = self.state.lock().await;
        if state.rejected.contains(stream) {
            return Err(Error::Rejected(stream.to_string()));
        }

        let stream_state = state.streams.entry(stream.to_string()).or_default();
        let id = format!("{}-0", stream_state.entries.len() + 1);
        stream_state.entries.push(CursorEntry {
            id: id.clone(),
            fields: fields.into_iter().collect(),
        });
        drop(state);

        self.appended.notify_waiters();

        Ok(id)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), Error> {
        self.record_operation();

        let mut state = self.state.lock().await;
        if let Some(stream_state) = state.streams.get_mut(stream) {
            let index = stream_state.entries.iter().position(|e| e.id == id);
            if let (Some(group_state), Some(index)) = (stream_state.groups.get_mut(group), index) {
                group_state.pending.remove(&index);
            }
        }

        Ok(())
    }

    async fn reader(&self) -> Result<MemoryReader, Error> {
        self.record_operation();

        Ok(MemoryReader {
            backend: self.clone(),
        })
    }
}

/// Reader over a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryReader {
    backend: MemoryBackend,
}

impl MemoryReader {
    async fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<CursorEntry>, Error> {
        let mut state = self.backend.state.lock().await;
        let no_group = || Error::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };

        let stream_state = state.streams.get_mut(stream).ok_or_else(no_group)?;
        let StreamState { entries, groups } = stream_state;
        let group_state = groups.get_mut(group).ok_or_else(no_group)?;

        let start = group_state.next_index;
        let end = entries.len().min(start + count);
        let now = Instant::now();

        for index in start..end {
            group_state.pending.insert(
                index,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                },
            );
        }
        group_state.next_index = end;

        Ok(entries[start..end].to_vec())
    }
}

#[async_trait]
impl CursorReader for MemoryReader {
    type Error = Error;

    async fn read_new(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<CursorEntry>, Error> {
        self.backend.record_operation();

        let deadline = Instant::now() + block;
        loop {
            // Registered before the check so an append in between still wakes us.
            let appended = self.backend.appended.notified();

            let entries = self.take_new(stream, group, consumer, count).await?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            if timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn claim_stale(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<CursorEntry>, Error> {
        self.backend.record_operation();

        let mut state = self.backend.state.lock().await;
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let StreamState { entries, groups } = stream_state;
        let Some(group_state) = groups.get_mut(group) else {
            return Err(Error::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (index, pending) in &mut group_state.pending {
            if claimed.len() == count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }

            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            claimed.push(entries[*index].clone());
        }
        drop(state);

        if !claimed.is_empty() {
            debug!(stream, group, consumer, count = claimed.len(), "claimed stale entries");
        }

        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    fn event_fields(body: &'static str) -> Vec<(String, Bytes)> {
        vec![("event".to_string(), Bytes::from_static(body.as_bytes()))]
    }

    #[tokio::test]
    async fn test_group_create_is_idempotent() {
        let backend = MemoryBackend::new();

        let first = backend
            .create_group("orders", "billing", &StartCursor::Beginning)
            .await
            .unwrap();
        let second = backend
            .create_group("orders", "billing", &StartCursor::New)
            .await
            .unwrap();

        assert_eq!(first, GroupCreation::Created);
        assert_eq!(second, GroupCreation::AlreadyExists);
        assert_eq!(backend.groups("orders").await, vec!["billing".to_string()]);
    }

    #[tokio::test]
    async fn test_read_new_delivers_each_entry_once_per_group() {
        let backend = MemoryBackend::new();
        backend
            .create_group("orders", "billing", &StartCursor::Beginning)
            .await
            .unwrap();
        backend.append("orders", event_fields("a")).await.unwrap();
        backend.append("orders", event_fields("b")).await.unwrap();

        let mut reader = backend.reader().await.unwrap();
        let first = reader
            .read_new("orders", "billing", "billing-1", 10, Duration::ZERO)
            .await
            .unwrap();
        let second = reader
            .read_new("orders", "billing", "billing-2", 10, Duration::ZERO)
            .await
            .unwrap();

        let ids: Vec<_> = first.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["1-0", "2-0"]);
        assert!(second.is_empty());
        assert_eq!(backend.pending_count("orders", "billing").await, 2);

        backend.ack("orders", "billing", "1-0").await.unwrap();
        assert_eq!(backend.pending_count("orders", "billing").await, 1);
    }

    #[tokio::test]
    async fn test_new_cursor_skips_existing_entries() {
        let backend = MemoryBackend::new();
        backend.append("orders", event_fields("old")).await.unwrap();
        backend
            .create_group("orders", "audit", &StartCursor::New)
            .await
            .unwrap();
        backend.append("orders", event_fields("new")).await.unwrap();

        let mut reader = backend.reader().await.unwrap();
        let entries = reader
            .read_new("orders", "audit", "audit-1", 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field("event"), Some(&Bytes::from_static(b"new")));
    }

    #[tokio::test]
    async fn test_read_new_wakes_on_append() {
        let backend = MemoryBackend::new();
        backend
            .create_group("orders", "billing", &StartCursor::Beginning)
            .await
            .unwrap();

        let mut reader = backend.reader().await.unwrap();
        let read = tokio::spawn(async move {
            reader
                .read_new("orders", "billing", "billing-1", 10, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.append("orders", event_fields("a")).await.unwrap();

        let entries = read.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let backend = MemoryBackend::new();
        backend.append("orders", event_fields("a")).await.unwrap();

        let mut reader = backend.reader().await.unwrap();
        let result = reader
            .read_new("orders", "missing", "missing-1", 10, Duration::ZERO)
            .await;

        assert_matches!(result, Err(Error::NoGroup { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_stale_transfers_idle_entries() {
        let backend = MemoryBackend::new();
        backend
            .create_group("orders", "billing", &StartCursor::Beginning)
            .await
            .unwrap();
        backend.append("orders", event_fields("a")).await.unwrap();

        let mut reader = backend.reader().await.unwrap();
        reader
            .read_new("orders", "billing", "billing-1", 10, Duration::ZERO)
            .await
            .unwrap();

        let early = reader
            .claim_stale("orders", "billing", "billing-2", Duration::from_secs(5), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;

        let claimed = reader
            .claim_stale("orders", "billing", "billing-2", Duration::from_secs(5), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, "1-0");
        assert_eq!(
            backend.pending_consumer("orders", "billing", "1-0").await,
            Some("billing-2".to_string())
        );
    }

    #[tokio::test]
    async fn test_rejected_stream_fails_appends() {
        let backend = MemoryBackend::new();
        backend.reject_appends_to("orders-dlq").await;

        let result = backend.append("orders-dlq", event_fields("a")).await;

        assert_matches!(result, Err(Error::Rejected(stream)) if stream == "orders-dlq");
        assert!(backend.append("orders", event_fields("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_start_id_is_rejected() {
        let backend = MemoryBackend::new();

        let result = backend
            .create_group("orders", "billing", &StartCursor::Id("abc".to_string()))
            .await;

        assert_matches!(result, Err(Error::InvalidCursor(_)));
    }
}
