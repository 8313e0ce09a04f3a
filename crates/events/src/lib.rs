//! Abstract interface for publishing and consuming event streams.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod consumer_config;
mod error;
mod event;
mod handler;
mod retry;
mod stream;
mod trace;

/// Group-cursor brokers: streams read through per-group cursors.
pub mod cursor;

pub use consumer_config::{
    ConsumerGroupConfig, DEFAULT_ACK_WAIT, DEFAULT_MAX_DELIVER, DeliveryMode, StartCursor,
    generate_consumer_name,
};
pub use error::{Error, ErrorKind, StreamError, require_non_empty};
pub use event::{APPLICATION_JSON, Event, SPEC_VERSION};
pub use handler::{EventContext, EventHandler, FnHandler, handler_fn};
pub use retry::{RetryDecision, RetryPolicy};
pub use stream::EventStream;
pub use trace::{Carrier, TraceBridge};
