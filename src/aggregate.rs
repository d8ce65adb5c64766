//! Aggregates: in-memory state holders whose state is the fold of their events.

use serde_json::{Map, Value};

use crate::event::Event;

/// Event-application function carried by an [`Aggregate`].
///
/// Takes the aggregate's mutable state mapping and the event to fold in.
/// Must be deterministic: given the same state and event it always produces
/// the same next state. The aggregate's `version` is maintained by
/// [`Aggregate::apply`] itself, so the function only touches state.
///
/// A plain function pointer rather than a boxed closure: appliers are pure
/// transition tables selected by `event_type`, registered once at startup.
pub type ApplyFn = fn(&mut Map<String, Value>, &Event);

/// The fallback applier for aggregate types with no registered behavior.
///
/// Copies every entry of an object payload into the state mapping,
/// overwriting existing keys. Non-object payloads leave state unchanged.
pub fn default_apply(state: &mut Map<String, Value>, event: &Event) {
    if let Value::Object(fields) = &event.payload {
        for (key, value) in fields {
            state.insert(key.clone(), value.clone());
        }
    }
}

/// A consistency boundary: an entity whose state is derived from its events.
///
/// The aggregate is a generic state holder -- `state` is an open JSON
/// mapping -- with event-type-specific transitions supplied as an
/// [`ApplyFn`]. Domain aggregates register their applier with the store
/// (see [`EventStore::register_aggregate`](crate::EventStore::register_aggregate));
/// unregistered types fall back to [`default_apply`].
///
/// # Contract
///
/// - [`apply`](Aggregate::apply) folds one event into state and sets
///   `version` to the event's version.
/// - [`raise_event`](Aggregate::raise_event) produces the next event in the
///   aggregate's version chain and applies it locally. Persisting the event
///   is the caller's responsibility.
#[derive(Debug, Clone)]
pub struct Aggregate {
    /// Aggregate instance identifier.
    pub id: String,
    /// Aggregate type name (e.g. `"Order"`).
    pub aggregate_type: String,
    /// Version of the last event folded in; 0 for a fresh aggregate.
    pub version: u64,
    /// Current state mapping.
    pub state: Map<String, Value>,
    apply_fn: ApplyFn,
}

impl Aggregate {
    /// Create a fresh aggregate using the [`default_apply`] behavior.
    pub fn new(id: impl Into<String>, aggregate_type: impl Into<String>) -> Self {
        Self::with_apply(id, aggregate_type, default_apply)
    }

    /// Create a fresh aggregate with a domain-specific applier.
    pub fn with_apply(
        id: impl Into<String>,
        aggregate_type: impl Into<String>,
        apply_fn: ApplyFn,
    ) -> Self {
        Self {
            id: id.into(),
            aggregate_type: aggregate_type.into(),
            version: 0,
            state: Map::new(),
            apply_fn,
        }
    }

    /// Fold a single event into the aggregate state.
    ///
    /// Runs the aggregate's applier, then records the event's version as
    /// the aggregate's current version.
    pub fn apply(&mut self, event: &Event) {
        (self.apply_fn)(&mut self.state, event);
        self.version = event.version;
    }

    /// Produce the next event in this aggregate's version chain.
    ///
    /// Constructs an [`Event`] at `version + 1`, applies it locally, and
    /// returns it. The returned event's version always equals the
    /// aggregate's new version. The event is **not** persisted -- hand it
    /// to [`EventStore::append`](crate::EventStore::append).
    ///
    /// # Arguments
    ///
    /// * `event_type` - Domain-defined event type name.
    /// * `payload` - JSON payload for the event.
    /// * `caused_by` - Optional id of the command that produced this event.
    pub fn raise_event(
        &mut self,
        event_type: impl Into<String>,
        payload: Value,
        caused_by: Option<&str>,
    ) -> Event {
        let mut event = Event::create(
            self.id.clone(),
            self.aggregate_type.clone(),
            event_type,
            payload,
            self.version + 1,
        );
        if let Some(cause) = caused_by {
            event = event.with_caused_by(cause);
        }
        self.apply(&event);
        event
    }
}
