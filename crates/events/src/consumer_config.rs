use crate::Error;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of delivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVER: u32 = 3;

/// Default time a consumer has to acknowledge a delivery.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(2);

/// How messages reach the members of a consumer group.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Broker pushes to a delivery subject load-balanced over the group.
    #[default]
    PushWithGroup,

    /// Group members fetch from the broker.
    Pull,
}

/// Where a newly created consumer group starts reading.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(from = "String", into = "String")]
pub enum StartCursor {
    /// First entry of the stream.
    #[default]
    Beginning,

    /// Only entries appended after the group is created.
    New,

    /// Entries after a backend-specific position.
    Id(String),
}

impl From<String> for StartCursor {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" | "0" | "beginning" => Self::Beginning,
            "$" | "new" => Self::New,
            _ => Self::Id(value),
        }
    }
}

impl From<StartCursor> for String {
    fn from(cursor: StartCursor) -> Self {
        match cursor {
            StartCursor::Beginning => "0".to_string(),
            StartCursor::New => "$".to_string(),
            StartCursor::Id(id) => id,
        }
    }
}

impl fmt::Display for StartCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Beginning => f.write_str("0"),
            Self::New => f.write_str("$"),
            Self::Id(id) => f.write_str(id),
        }
    }
}

/// Declarative policy for how a named group consumes a stream.
///
/// Every field is optional in configuration files; durations are written
/// like `"2s"` or `"500ms"`. A group's configuration is fixed once the group
/// exists.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ConsumerGroupConfig {
    /// Durable group name. Filled from the subscription when left empty.
    pub group_name: String,

    /// Optional consumer name, distinct from the durable group name.
    pub name: Option<String>,

    /// Free-form description stored with the group where supported.
    pub description: Option<String>,

    /// Time to acknowledge a delivery before it counts as failed.
    #[serde(with = "humantime_serde")]
    pub ack_wait: Duration,

    /// Total delivery attempts, at least 1.
    pub max_deliver: u32,

    /// Subject filter applied to the stream.
    pub filter_subject: Option<String>,

    /// Multiple subject filters, where the backend supports them.
    pub filter_subjects: Vec<String>,

    /// Push to a group, or pull.
    pub delivery_mode: DeliveryMode,

    /// Subject pushed deliveries are sent to.
    pub deliver_subject: Option<String>,

    /// Queue group pushed deliveries are balanced over.
    pub deliver_group: Option<String>,

    /// Stream or subject receiving messages that exhausted `max_deliver`.
    /// Empty means exhausted messages are acknowledged and dropped.
    pub dead_letter_target: String,

    /// Redelivery delays; the last entry repeats for later attempts.
    #[serde(with = "humantime_vec")]
    pub backoff: Vec<Duration>,

    /// Replica count for the group state.
    pub replicas: usize,

    /// Where a newly created group starts.
    pub start_cursor: StartCursor,

    /// Maximum outstanding unacknowledged deliveries.
    pub max_ack_pending: Option<i64>,

    /// Maximum outstanding pull requests.
    pub max_waiting: Option<i64>,

    /// Deliver headers only, without payload.
    pub headers_only: bool,

    /// Idle time after which an unused group is removed by the broker.
    #[serde(with = "humantime_serde")]
    pub inactive_threshold: Option<Duration>,
}

impl Default for ConsumerGroupConfig {
    fn default() -> Self {
        Self {
            group_name: String::new(),
            name: None,
            description: None,
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: DEFAULT_MAX_DELIVER,
            filter_subject: None,
            filter_subjects: Vec::new(),
            delivery_mode: DeliveryMode::default(),
            deliver_subject: None,
            deliver_group: None,
            dead_letter_target: String::new(),
            backoff: Vec::new(),
            replicas: 1,
            start_cursor: StartCursor::default(),
            max_ack_pending: None,
            max_waiting: None,
            headers_only: false,
            inactive_threshold: None,
        }
    }
}

impl ConsumerGroupConfig {
    /// Defaults for the given group.
    #[must_use]
    pub fn for_group(group: impl Into<String>) -> Self {
        Self {
            group_name: group.into(),
            ..Self::default()
        }
    }

    /// Sets the acknowledgement wait.
    #[must_use]
    pub const fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Sets the delivery attempt limit.
    #[must_use]
    pub const fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    /// Sets the backoff schedule.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the dead-letter target.
    #[must_use]
    pub fn with_dead_letter_target(mut self, target: impl Into<String>) -> Self {
        self.dead_letter_target = target.into();
        self
    }

    /// Sets the subject filter.
    #[must_use]
    pub fn with_filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = Some(subject.into());
        self
    }

    /// Sets the delivery mode.
    #[must_use]
    pub const fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Sets the start cursor.
    #[must_use]
    pub fn with_start_cursor(mut self, cursor: StartCursor) -> Self {
        self.start_cursor = cursor;
        self
    }

    /// Whether exhausted messages are forwarded rather than dropped.
    #[must_use]
    pub fn has_dead_letter_target(&self) -> bool {
        !self.dead_letter_target.trim().is_empty()
    }

    /// Checks the invariants of the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `max_deliver` is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_deliver == 0 {
            return Err(Error::InvalidArgument(format!(
                "max_deliver must be at least 1 for group `{}`",
                self.group_name
            )));
        }

        Ok(())
    }
}

/// Builds a unique member name for a consumer group: `<group>-<uuid>`.
#[must_use]
pub fn generate_consumer_name(group: &str) -> String {
    format!("{group}-{}", uuid::Uuid::new_v4())
}

mod humantime_vec {
    use std::time::Duration;

    use humantime_serde::Serde;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(value.iter().copied().map(Serde::from))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Duration>, D::Error> {
        Vec::<Serde<Duration>>::deserialize(deserializer)
            .map(|delays| delays.into_iter().map(Serde::into_inner).collect())
    }
}
