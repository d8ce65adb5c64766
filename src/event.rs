//! The immutable domain event record and its constructors.
//!
//! Events are created once (by [`Event::create`] or
//! [`Aggregate::raise_event`](crate::Aggregate::raise_event)) and never
//! mutated afterwards. The store assigns each a global `position` on append;
//! producers never set it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// An immutable, versioned record of a past domain fact.
///
/// `version` is the aggregate-local sequence number: strictly increasing by
/// one per aggregate, starting at 1. `position` is the store-global sequence
/// number assigned on append; it is `0` on freshly created events and only
/// populated on events read back from the store.
///
/// Equality is by `id` alone -- two `Event` values with the same id denote
/// the same domain fact regardless of which fields happen to be populated
/// (e.g. `position` before and after persistence).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique event identifier (UUID v4).
    pub id: Uuid,
    /// Aggregate this event belongs to. Required, non-empty.
    pub aggregate_id: String,
    /// Aggregate type name (e.g. `"Order"`).
    pub aggregate_type: String,
    /// Domain-defined event type name (e.g. `"OrderCreated"`).
    pub event_type: String,
    /// Opaque JSON payload.
    pub payload: Value,
    /// Aggregate-local sequence number, starting at 1.
    pub version: u64,
    /// UTC creation time, persisted as an RFC 3339 string.
    pub timestamp: DateTime<Utc>,
    /// Identifier of the command or external event that caused this event.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub caused_by: Option<String>,
    /// Arbitrary key-value metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Store-global position. Zero until assigned on append.
    #[serde(default)]
    pub position: u64,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl Event {
    /// Create a new event with a fresh UUID v4 id and the current UTC time.
    ///
    /// The `position` field is left at zero; the store assigns the real
    /// position when the event is appended.
    ///
    /// # Arguments
    ///
    /// * `aggregate_id` - The aggregate this event belongs to.
    /// * `aggregate_type` - The aggregate type name.
    /// * `event_type` - Domain-defined event type name.
    /// * `payload` - JSON payload carried by the event.
    /// * `version` - Aggregate-local sequence number for this event.
    pub fn create(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
        version: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            payload,
            version,
            timestamp: Utc::now(),
            caused_by: None,
            metadata: Map::new(),
            position: 0,
        }
    }

    /// Set the causation link to the command or event that produced this one.
    pub fn with_caused_by(mut self, caused_by: impl Into<String>) -> Self {
        self.caused_by = Some(caused_by.into());
        self
    }

    /// Attach arbitrary metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}
