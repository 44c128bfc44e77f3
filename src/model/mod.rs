//! Data model.

mod event;
mod identification;
mod record;

pub use event::{Event, EventMetadata};
pub use identification::{IdentificationHash, IdentificationKeys};
pub use record::{Record, RecordMetadata};
