//! Redis Streams backend for group-cursor event streams.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ebrick_events::StartCursor;
use ebrick_events::cursor::{CursorBackend, CursorEntry, CursorReader, GroupCreation};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, IntoConnectionInfo, Value};
use tracing::{debug, info, instrument};

const BUSY_GROUP: &str = "BUSYGROUP";

/// Options for [`RedisBackend`].
#[derive(Clone, Debug, Default)]
pub struct RedisBackendOptions {
    /// Server URL, e.g. `redis://localhost:6379`.
    pub url: String,

    /// ACL user. Overrides any user in the URL.
    pub username: Option<String>,

    /// Password. Overrides any password in the URL.
    pub password: Option<String>,
}

/// Group-cursor backend over Redis Streams.
///
/// Non-blocking commands share one auto-reconnecting connection; every reader
/// opens its own connection so a blocked `XREADGROUP` never stalls publishers.
#[derive(Clone)]
pub struct RedisBackend {
    client: Client,
    connection: ConnectionManager,
}

impl Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("addr", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connects to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server cannot be reached.
    pub async fn connect(
        RedisBackendOptions {
            url,
            username,
            password,
        }: RedisBackendOptions,
    ) -> Result<Self, Error> {
        let mut info = url.as_str().into_connection_info().map_err(Error::InvalidUrl)?;

        if username.is_some() {
            info.redis.username = username;
        }
        if password.is_some() {
            info.redis.password = password;
        }

        let client = Client::open(info).map_err(Error::InvalidUrl)?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(Error::Connect)?;

        info!(addr = %client.get_connection_info().addr, "connected to redis");

        Ok(Self { client, connection })
    }
}

#[async_trait]
impl CursorBackend for RedisBackend {
    type Error = Error;
    type Reader = RedisReader;

    #[instrument(skip(self))]
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: &StartCursor,
    ) -> Result<GroupCreation, Error> {
        let mut connection = self.connection.clone();
        let start = start.to_string();

        let created: Result<(), redis::RedisError> = connection
            .xgroup_create_mkstream(stream, group, &start)
            .await;

        match created {
            Ok(()) => {
                debug!(stream, group, start = %start, "created redis consumer group");
                Ok(GroupCreation::Created)
            }
            Err(e) if e.code() == Some(BUSY_GROUP) => Ok(GroupCreation::AlreadyExists),
            Err(e) => Err(Error::command("XGROUP CREATE")(e)),
        }
    }

    async fn append(&self, stream: &str, fields: Vec<(String, Bytes)>) -> Result<String, Error> {
        let mut connection = self.connection.clone();
        let items: Vec<(String, Vec<u8>)> = fields
            .into_iter()
            .map(|(name, value)| (name, value.to_vec()))
            .collect();

        connection
            .xadd(stream, "*", &items)
            .await
            .map_err(Error::command("XADD"))
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), Error> {
        let mut connection = self.connection.clone();

        let _: u64 = connection
            .xack(stream, group, &[id])
            .await
            .map_err(Error::command("XACK"))?;

        Ok(())
    }

    async fn reader(&self) -> Result<RedisReader, Error> {
        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(Error::Connect)?;

        Ok(RedisReader { connection })
    }
}

/// Reader holding a dedicated connection for blocking reads.
pub struct RedisReader {
    connection: MultiplexedConnection,
}

impl Debug for RedisReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisReader").finish_non_exhaustive()
    }
}

#[async_trait]
impl CursorReader for RedisReader {
    type Error = Error;

    async fn read_new(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<CursorEntry>, Error> {
        // BLOCK 0 waits forever.
        let block_ms = usize::try_from(block.as_millis())
            .unwrap_or(usize::MAX)
            .max(1);
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);

        let reply: Option<StreamReadReply> = self
            .connection
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(Error::command("XREADGROUP"))?;

        reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(|id| to_entry(id, "XREADGROUP"))
            .collect()
    }

    async fn claim_stale(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<CursorEntry>, Error> {
        let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);

        let reply: Vec<Value> = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.connection)
            .await
            .map_err(Error::command("XAUTOCLAIM"))?;

        // [next-cursor, claimed entries, deleted ids (7.0+)]
        let claimed = reply.get(1).ok_or_else(|| Error::Reply {
            command: "XAUTOCLAIM",
            reason: format!("expected at least 2 elements, got {}", reply.len()),
        })?;

        // Entries deleted while pending come back as nil before 7.0.
        let ids: Vec<Option<StreamId>> =
            redis::from_redis_value(claimed).map_err(Error::command("XAUTOCLAIM"))?;

        ids.into_iter()
            .flatten()
            .map(|id| to_entry(id, "XAUTOCLAIM"))
            .collect()
    }
}

fn to_entry(StreamId { id, map }: StreamId, command: &'static str) -> Result<CursorEntry, Error> {
    let fields = map
        .into_iter()
        .map(|(name, value)| {
            let value: Vec<u8> = redis::from_redis_value(&value).map_err(|e| Error::Reply {
                command,
                reason: format!("field `{name}` is not a string: {e}"),
            })?;

            Ok((name, Bytes::from(value)))
        })
        .collect::<Result<HashMap<_, _>, Error>>()?;

    Ok(CursorEntry { id, fields })
}

#[cfg(test)]
mod tests {
    use super::*;

    use ebrick_events::cursor::{EVENT_FIELD, TRACE_FIELD};
    use ebrick_events::{ConsumerGroupConfig, Event, EventStream, handler_fn};
    use ebrick_events_cursor::{CursorEvents, CursorEventsOptions};
    use serial_test::serial;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const REDIS_URL: &str = "redis://127.0.0.1:6379";

    async fn backend() -> RedisBackend {
        RedisBackend::connect(RedisBackendOptions {
            url: REDIS_URL.to_string(),
            ..RedisBackendOptions::default()
        })
        .await
        .unwrap()
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let result = RedisBackend::connect(RedisBackendOptions {
            url: "not a url".to_string(),
            ..RedisBackendOptions::default()
        })
        .await;

        assert!(matches!(result, Err(Error::InvalidUrl(_))));
    }

    #[tokio::test]
    #[serial]
    #[ignore = "Requires Redis server"]
    async fn test_group_create_reports_busy_group() {
        let backend = backend().await;
        let stream = unique("orders");

        let first = backend
            .create_group(&stream, "billing", &StartCursor::Beginning)
            .await
            .unwrap();
        let second = backend
            .create_group(&stream, "billing", &StartCursor::Beginning)
            .await
            .unwrap();

        assert_eq!(first, GroupCreation::Created);
        assert_eq!(second, GroupCreation::AlreadyExists);
    }

    #[tokio::test]
    #[serial]
    #[ignore = "Requires Redis server"]
    async fn test_read_ack_and_claim() {
        let backend = backend().await;
        let stream = unique("orders");

        backend
            .create_group(&stream, "billing", &StartCursor::Beginning)
            .await
            .unwrap();
        let id = backend
            .append(
                &stream,
                vec![
                    (EVENT_FIELD.to_string(), Bytes::from_static(b"{}")),
                    (TRACE_FIELD.to_string(), Bytes::from_static(b"{}")),
                ],
            )
            .await
            .unwrap();

        let mut reader = backend.reader().await.unwrap();
        let entries = reader
            .read_new(&stream, "billing", "billing-1", 1, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].field(EVENT_FIELD), Some(&Bytes::from_static(b"{}")));

        let claimed = reader
            .claim_stale(&stream, "billing", "billing-2", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        backend.ack(&stream, "billing", &id).await.unwrap();

        let claimed = reader
            .claim_stale(&stream, "billing", "billing-3", Duration::ZERO, 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    #[serial]
    #[ignore = "Requires Redis server"]
    async fn test_publish_and_subscribe() {
        let stream = unique("orders");
        let events = CursorEvents::new(backend().await, CursorEventsOptions::default());

        events
            .create_consumer_group(&stream, "billing", ConsumerGroupConfig::default())
            .await
            .unwrap();

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let handler = handler_fn(move |event: Event, _context| {
            let sender = sender.clone();
            async move {
                let _ = sender.send(event.id().to_string());
                Ok::<(), std::io::Error>(())
            }
        });
        events.subscribe(&stream, "billing", handler).await.unwrap();

        let event = Event::new("test", "order.created", &"payload")
            .unwrap()
            .with_id("e1");
        events.publish(&stream, &event).await.unwrap();

        let received = timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "e1");

        events.close().await.unwrap();
    }
}
