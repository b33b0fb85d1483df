use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::utils::error::BusError;

/// Domain payload carried by an envelope. Opaque to the bus.
pub type Payload = Map<String, Value>;

fn default_version() -> u32 {
    1
}

/// A published domain event.
///
/// Immutable once built: fields are private and only exposed by reference.
/// Handlers that need to change the payload must copy it first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    event_name: String,
    data: Payload,
    timestamp: DateTime<Utc>,
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
    #[serde(default = "default_version")]
    version: u32,
}

impl EventEnvelope {
    /// Build a new envelope with a fresh message id.
    ///
    /// Fails if `event_name` is not a valid dot-namespaced name.
    pub fn new(
        event_name: &str,
        data: Payload,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, BusError> {
        validate_event_name(event_name)?;
        Ok(Self {
            event_name: event_name.to_string(),
            data,
            timestamp,
            source: source.to_string(),
            message_id: Some(Uuid::new_v4().to_string()),
            version: 1,
        })
    }

    /// Set the schema version of `data`.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Absent only for envelopes produced by publishers that predate it.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Decode `data` into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_value(Value::Object(self.data.clone()))?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a wire body. The event name is validated as well as the shape.
    pub fn from_bytes(body: &[u8]) -> Result<Self, BusError> {
        let envelope: EventEnvelope = serde_json::from_slice(body)?;
        validate_event_name(&envelope.event_name)?;
        Ok(envelope)
    }
}

/// Event names are dot-namespaced, e.g. `booking.confirmed`: at least one
/// segment, no empty segments, no wildcards or whitespace.
pub fn validate_event_name(name: &str) -> Result<(), BusError> {
    let valid = !name.is_empty()
        && name.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });

    if valid {
        Ok(())
    } else {
        Err(BusError::InvalidEventName(name.to_string()))
    }
}

/// Hands out timestamps that never go backwards within one process, even if
/// the wall clock does.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    pub(super) last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stamp = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}
