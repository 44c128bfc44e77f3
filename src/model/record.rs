use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::Event;

/// The unit of data flowing through a pipeline.
///
/// A record is a cheap, immutable, shared handle to an event. Cloning a record clones the handle,
/// not the event. Mutation goes through `event_mut`, which copies the event first if any other
/// record still shares it.
#[derive(Clone, Debug)]
pub struct Record {
    event: Arc<Event>,
    metadata: Arc<RecordMetadata>,
}

/// Optional metadata carried alongside an event, used for routing decisions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordMetadata {
    pub attributes: BTreeMap<String, String>,
}

impl Record {
    /// Create a new record wrapping the given event.
    pub fn new(event: Event) -> Self {
        Self {
            event: Arc::new(event),
            metadata: Default::default(),
        }
    }

    /// Create a new record wrapping the given event and metadata.
    pub fn with_metadata(event: Event, metadata: RecordMetadata) -> Self {
        Self {
            event: Arc::new(event),
            metadata: Arc::new(metadata),
        }
    }

    /// The event of this record.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// A mutable handle to this record's event, copied first if shared with any other record.
    pub fn event_mut(&mut self) -> &mut Event {
        Arc::make_mut(&mut self.event)
    }

    /// The metadata of this record.
    pub fn metadata(&self) -> &RecordMetadata {
        &self.metadata
    }

    /// Create an independent copy of this record which shares no state with the original.
    pub fn deep_copy(&self) -> Self {
        Self {
            event: Arc::new(self.event.as_ref().clone()),
            metadata: Arc::new(self.metadata.as_ref().clone()),
        }
    }

    /// Check if this record and the given record point to the same event.
    pub fn shares_event_with(&self, other: &Record) -> bool {
        Arc::ptr_eq(&self.event, &other.event)
    }

    /// Unwrap this record into its event, cloning only if the event is still shared.
    pub fn into_event(self) -> Event {
        Arc::try_unwrap(self.event).unwrap_or_else(|event| event.as_ref().clone())
    }
}

impl From<Event> for Record {
    fn from(event: Event) -> Self {
        Self::new(event)
    }
}
