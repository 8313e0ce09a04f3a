use crate::Error;

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

/// The CloudEvents spec version written and accepted on the wire.
pub const SPEC_VERSION: &str = "1.0";

/// Content type set by [`Event::new`].
pub const APPLICATION_JSON: &str = "application/json";

/// Wire document: attributes plus the JSON payload embedded verbatim.
#[derive(Serialize)]
struct Document<'a> {
    #[serde(flatten)]
    attributes: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a RawValue>,
}

/// The `data` member of a wire document, exactly as written.
#[derive(Deserialize)]
struct RawData<'a> {
    #[serde(borrow)]
    data: Option<&'a RawValue>,
}

const RESERVED_ATTRIBUTES: [&str; 8] = [
    "specversion",
    "id",
    "source",
    "type",
    "time",
    "datacontenttype",
    "data",
    "data_base64",
];

/// A self-describing event record exchanged between producers and consumers.
///
/// Encoded as a CloudEvents 1.0 JSON document in structured mode. The payload
/// is opaque to the streams: JSON payloads travel in `data`, anything else in
/// `data_base64`.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    id: String,
    event_type: String,
    source: String,
    time: Option<DateTime<Utc>>,
    data_content_type: Option<String>,
    payload: Bytes,
    extensions: HashMap<String, String>,
}

impl Event {
    /// Creates an event carrying `data` as a JSON payload, with a fresh id and
    /// the current time.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encode` if `data` cannot be serialized.
    pub fn new<T>(
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: &T,
    ) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(data).map_err(Error::Encode)?;

        Ok(Self::binary(source, event_type, Some(APPLICATION_JSON), payload))
    }

    /// Creates an event with an opaque payload, a fresh id and the current time.
    pub fn binary(
        source: impl Into<String>,
        event_type: impl Into<String>,
        data_content_type: Option<&str>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            time: Some(Utc::now()),
            data_content_type: data_content_type.map(ToString::to_string),
            payload: payload.into(),
            extensions: HashMap::new(),
        }
    }

    /// Replaces the id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Replaces the timestamp.
    #[must_use]
    pub const fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Replaces the payload and its content type.
    #[must_use]
    pub fn with_payload(
        mut self,
        data_content_type: Option<&str>,
        payload: impl Into<Bytes>,
    ) -> Self {
        self.data_content_type = data_content_type.map(ToString::to_string);
        self.payload = payload.into();
        self
    }

    /// Adds an extension attribute.
    #[must_use]
    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    /// The event id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The event type.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The event source.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// When the event occurred.
    #[must_use]
    pub const fn time(&self) -> Option<&DateTime<Utc>> {
        self.time.as_ref()
    }

    /// The payload content type.
    #[must_use]
    pub fn data_content_type(&self) -> Option<&str> {
        self.data_content_type.as_deref()
    }

    /// The raw payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// All extension attributes.
    #[must_use]
    pub const fn extensions(&self) -> &HashMap<String, String> {
        &self.extensions
    }

    /// A single extension attribute.
    #[must_use]
    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extensions.get(name).map(String::as_str)
    }

    /// Deserializes the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the payload is not valid JSON for `T`.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.payload).map_err(Error::Decode)
    }

    /// Checks the attributes every published event must carry.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `id` or `type` is empty.
    pub fn validate(&self) -> Result<(), Error> {
        if self.id.is_empty() {
            return Err(Error::InvalidArgument("event id must not be empty".into()));
        }

        if self.event_type.is_empty() {
            return Err(Error::InvalidArgument(
                "event type must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Encodes the event as a CloudEvents JSON document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encode` if the document cannot be written.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut document = Map::new();
        document.insert("specversion".into(), SPEC_VERSION.into());
        document.insert("id".into(), self.id.clone().into());
        document.insert("source".into(), self.source.clone().into());
        document.insert("type".into(), self.event_type.clone().into());

        if let Some(time) = &self.time {
            document.insert(
                "time".into(),
                time.to_rfc3339_opts(SecondsFormat::AutoSi, true).into(),
            );
        }

        if let Some(content_type) = &self.data_content_type {
            document.insert("datacontenttype".into(), content_type.clone().into());
        }

        let data = if self.payload.is_empty() {
            None
        } else {
            self.json_payload()
        };

        if data.is_none() && !self.payload.is_empty() {
            document.insert("data_base64".into(), BASE64.encode(&self.payload).into());
        }

        for (name, value) in &self.extensions {
            if !RESERVED_ATTRIBUTES.contains(&name.as_str()) {
                document.insert(name.clone(), value.clone().into());
            }
        }

        serde_json::to_vec(&Document {
            attributes: document,
            data,
        })
        .map(Bytes::from)
        .map_err(Error::Encode)
    }

    fn json_payload(&self) -> Option<&RawValue> {
        if !is_json(self.data_content_type.as_deref()) {
            return None;
        }

        let text = std::str::from_utf8(&self.payload).ok()?;
        serde_json::from_str::<&RawValue>(text).ok()
    }

    /// Decodes a CloudEvents JSON document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the body is not a CloudEvents 1.0
    /// JSON object.
    pub fn from_bytes(body: &[u8]) -> Result<Self, Error> {
        let Value::Object(mut document) =
            serde_json::from_slice::<Value>(body).map_err(Error::Decode)?
        else {
            return Err(Error::Decode(serde::de::Error::custom(
                "expected a JSON object",
            )));
        };

        let spec_version = take_string(&mut document, "specversion")?;
        if spec_version != SPEC_VERSION {
            return Err(Error::UnsupportedSpecVersion(spec_version));
        }

        let id = take_string(&mut document, "id")?;
        let source = take_string(&mut document, "source")?;
        let event_type = take_string(&mut document, "type")?;

        let time = match document.remove("time") {
            Some(Value::String(time)) => Some(
                DateTime::parse_from_rfc3339(&time)
                    .map_err(|e| Error::Decode(serde::de::Error::custom(e)))?
                    .with_timezone(&Utc),
            ),
            _ => None,
        };

        let data_content_type = match document.remove("datacontenttype") {
            Some(Value::String(content_type)) => Some(content_type),
            _ => None,
        };

        // The parsed `data` value is lossy; the payload comes from its raw text.
        document.remove("data");
        let raw = serde_json::from_slice::<RawData<'_>>(body)
            .map_err(Error::Decode)?
            .data;

        let payload = match (raw, document.remove("data_base64")) {
            (_, Some(Value::String(encoded))) => Bytes::from(BASE64.decode(encoded)?),
            (Some(raw), None) if !is_json(data_content_type.as_deref()) => {
                serde_json::from_str::<String>(raw.get()).map_or_else(
                    |_| Bytes::copy_from_slice(raw.get().as_bytes()),
                    Bytes::from,
                )
            }
            (Some(raw), None) => Bytes::copy_from_slice(raw.get().as_bytes()),
            _ => Bytes::new(),
        };

        let extensions = document
            .into_iter()
            .map(|(name, value)| match value {
                Value::String(value) => (name, value),
                other => (name, other.to_string()),
            })
            .collect();

        Ok(Self {
            id,
            event_type,
            source,
            time,
            data_content_type,
            payload,
            extensions,
        })
    }
}

fn take_string(document: &mut Map<String, Value>, name: &'static str) -> Result<String, Error> {
    match document.remove(name) {
        Some(Value::String(value)) => Ok(value),
        _ => Err(Error::MissingAttribute(name)),
    }
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type.is_none_or(|content_type| {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        essence == APPLICATION_JSON || essence == "text/json" || essence.ends_with("+json")
    })
}
