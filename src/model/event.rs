use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

/// A structured telemetry payload.
///
/// The attribute map preserves insertion order, which is also the order used on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The event's attributes.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// The event's metadata.
    pub metadata: EventMetadata,
}

/// Metadata describing an event, independent of its attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// The unique ID of this event.
    pub id: Uuid,
    /// The type of this event, as declared by the source which produced it.
    pub event_type: String,
    /// The time at which this event entered the system.
    #[serde(with = "time::serde::rfc3339")]
    pub time_received: OffsetDateTime,
    /// Free-form metadata attributes, not part of the event's data.
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// Tags attached to this event by processors.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Event {
    /// Create a new empty event of the given type.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            data: Map::new(),
            metadata: EventMetadata {
                id: Uuid::new_v4(),
                event_type: event_type.into(),
                time_received: OffsetDateTime::now_utc(),
                attributes: Map::new(),
                tags: BTreeSet::new(),
            },
        }
    }

    /// Builder-style variant of `put`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.put(key, value);
        self
    }

    /// Get the value of the given attribute, if present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Set the value of the given attribute, returning the previous value if any.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.data.insert(key.into(), value.into())
    }

    /// Remove the given attribute, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Add a tag to this event.
    pub fn tag(&mut self, tag: impl Into<String>) {
        self.metadata.tags.insert(tag.into());
    }

    /// Check if this event carries the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata.tags.contains(tag)
    }
}
