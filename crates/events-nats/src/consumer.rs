use std::collections::HashMap;

use async_nats::jetstream::consumer::{self, AckPolicy, DeliverPolicy, pull, push};
use ebrick_events::{ConsumerGroupConfig, RetryPolicy, StartCursor};
use tracing::warn;

/// Consumer metadata key holding the dead-letter subject of a group.
pub const DEAD_LETTER_METADATA: &str = "dead_letter_target";

fn deliver_policy(cursor: &StartCursor) -> DeliverPolicy {
    match cursor {
        StartCursor::Beginning => DeliverPolicy::All,
        StartCursor::New => DeliverPolicy::New,
        StartCursor::Id(id) => id.parse().map_or_else(
            |_| {
                warn!(start = %id, "start cursor is not a stream sequence, delivering all");
                DeliverPolicy::All
            },
            |start_sequence| DeliverPolicy::ByStartSequence { start_sequence },
        ),
    }
}

fn metadata(config: &ConsumerGroupConfig) -> HashMap<String, String> {
    let mut metadata = HashMap::new();

    if config.has_dead_letter_target() {
        metadata.insert(
            DEAD_LETTER_METADATA.to_string(),
            config.dead_letter_target.clone(),
        );
    }

    metadata
}

/// Push consumer load-balanced over the members of `name`.
pub fn push_config(
    name: &str,
    deliver_subject: String,
    config: &ConsumerGroupConfig,
) -> push::Config {
    push::Config {
        durable_name: Some(name.to_string()),
        description: config.description.clone(),
        deliver_subject,
        deliver_group: Some(
            config
                .deliver_group
                .clone()
                .unwrap_or_else(|| name.to_string()),
        ),
        deliver_policy: deliver_policy(&config.start_cursor),
        ack_policy: AckPolicy::Explicit,
        ack_wait: config.ack_wait,
        max_deliver: i64::from(config.max_deliver),
        backoff: config.backoff.clone(),
        filter_subject: config.filter_subject.clone().unwrap_or_default(),
        filter_subjects: config.filter_subjects.clone(),
        num_replicas: config.replicas,
        max_ack_pending: config.max_ack_pending.unwrap_or_default(),
        headers_only: config.headers_only,
        inactive_threshold: config.inactive_threshold.unwrap_or_default(),
        metadata: metadata(config),
        ..Default::default()
    }
}

/// Pull consumer shared by the members of `name`.
pub fn pull_config(name: &str, config: &ConsumerGroupConfig) -> pull::Config {
    pull::Config {
        durable_name: Some(name.to_string()),
        description: config.description.clone(),
        deliver_policy: deliver_policy(&config.start_cursor),
        ack_policy: AckPolicy::Explicit,
        ack_wait: config.ack_wait,
        max_deliver: i64::from(config.max_deliver),
        backoff: config.backoff.clone(),
        filter_subject: config.filter_subject.clone().unwrap_or_default(),
        filter_subjects: config.filter_subjects.clone(),
        num_replicas: config.replicas,
        max_ack_pending: config.max_ack_pending.unwrap_or_default(),
        max_waiting: config.max_waiting.unwrap_or_default(),
        headers_only: config.headers_only,
        inactive_threshold: config.inactive_threshold.unwrap_or_default(),
        metadata: metadata(config),
        ..Default::default()
    }
}

/// Retry policy and dead-letter target as stored on the server.
pub fn delivery_settings(config: &consumer::Config) -> (RetryPolicy, Option<String>) {
    // Zero or negative means unlimited.
    let max_deliver = u32::try_from(config.max_deliver)
        .ok()
        .filter(|max| *max > 0)
        .unwrap_or(u32::MAX);

    let ack_wait = if config.ack_wait.is_zero() {
        ebrick_events::DEFAULT_ACK_WAIT
    } else {
        config.ack_wait
    };

    let target = config
        .metadata
        .get(DEAD_LETTER_METADATA)
        .filter(|target| !target.trim().is_empty())
        .cloned();

    (
        RetryPolicy::new(max_deliver, ack_wait, config.backoff.clone()),
        target,
    )
}

/// Durable consumer name for the dead-letter subscription of `subject`.
pub fn dead_letter_consumer_name(subject: &str) -> String {
    let sanitized: String = subject
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' => '_',
            c => c,
        })
        .collect();

    format!("{sanitized}-dlq")
}
