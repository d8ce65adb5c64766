//! Read models ("projections") that fold the global event stream, and the
//! manager that registers, persists, rebuilds, and advances them.
//!
//! A projection's state and cursor persist together in a single row of the
//! `projections` table, so persistence is the atomic commit point: a
//! process killed mid-pass resumes from the last durably saved
//! `(state, position)` on the next [`ProjectionManager::register`].

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use serde_json::{Map, Value};

use crate::error::{HandlerError, Result, StoreError};
use crate::event::Event;
use crate::storage::Database;
use crate::store::EventStore;

/// Handler invoked for one event type: mutates projection state in place.
///
/// Must be deterministic: a rebuild from position 0 always yields the
/// same final state. A returned error is treated as a programming error:
/// the current pass aborts and the cursor is not persisted past the
/// failing event.
pub type ProjectionHandler =
    Box<dyn Fn(&mut Map<String, Value>, &Event) -> std::result::Result<(), HandlerError> + Send + Sync>;

/// A named read model: a bundle of per-event-type handlers plus state.
///
/// Built with [`Projection::new`] and [`on`](Projection::on), then handed
/// to [`ProjectionManager::register`]. State is rebuildable from the log
/// at any time; `position` is the last global position processed (0 means
/// fresh).
///
/// # Examples
///
/// ```
/// use foldlog::Projection;
///
/// let totals = Projection::new("totals").on("OrderCreated", |state, event| {
///     state.insert(event.aggregate_id.clone(), event.payload["total"].clone());
///     Ok(())
/// });
/// assert_eq!(totals.name, "totals");
/// ```
pub struct Projection {
    /// Unique projection name; primary key of the persisted cursor row.
    pub name: String,
    /// Current state mapping.
    pub state: Map<String, Value>,
    /// Last global position processed; 0 for a fresh projection.
    pub position: u64,
    handlers: HashMap<String, ProjectionHandler>,
}

impl std::fmt::Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection")
            .field("name", &self.name)
            .field("position", &self.position)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Projection {
    /// Create an empty projection with no handlers.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Map::new(),
            position: 0,
            handlers: HashMap::new(),
        }
    }

    /// Attach a handler for one event type. Re-registration replaces.
    pub fn on<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut Map<String, Value>, &Event) -> std::result::Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(event_type.into(), Box::new(handler));
        self
    }

    /// Run the handler registered for this event's type, if any.
    ///
    /// Returns `Ok(true)` when a handler ran, `Ok(false)` when the event
    /// type has no handler (the event still counts toward the cursor).
    fn handle(&mut self, event: &Event) -> Result<bool> {
        let Some(handler) = self.handlers.get(&event.event_type) else {
            return Ok(false);
        };
        handler(&mut self.state, event).map_err(|e| StoreError::ProjectionHandler {
            name: self.name.clone(),
            position: event.position,
            message: e.to_string(),
        })?;
        Ok(true)
    }
}

/// Registers projections and drives their progression over the log.
///
/// Two modes of progression:
///
/// - [`rebuild`](ProjectionManager::rebuild) resets `(state, position)` to
///   `({}, 0)` and streams the full log;
/// - [`advance`](ProjectionManager::advance) continues from the persisted
///   cursor without resetting state.
///
/// Both persist state and cursor together after the pass. The cursor
/// advances over **all** events visited, handled or not -- adding a
/// handler for a previously unhandled event type later requires an
/// explicit rebuild rather than silently replaying part of the log.
pub struct ProjectionManager {
    store: EventStore,
    projections: HashMap<String, Projection>,
}

impl ProjectionManager {
    /// Create a manager over the given store.
    pub fn new(store: EventStore) -> Self {
        Self {
            store,
            projections: HashMap::new(),
        }
    }

    /// Register a projection, restoring any persisted state and cursor.
    ///
    /// If a row for `projection.name` exists, its `(state, position)` are
    /// restored into the projection; otherwise a fresh `({}, 0)` row is
    /// persisted. The projection joins the active set either way.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] on SQLite failure,
    /// [`StoreError::Serialization`] if persisted state fails to decode.
    pub fn register(&mut self, mut projection: Projection) -> Result<()> {
        let persisted: Option<(String, i64)> = self
            .database()
            .conn()
            .query_row(
                "SELECT state, position FROM projections WHERE name = ?1",
                params![projection.name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match persisted {
            Some((state_raw, position)) => {
                projection.state = serde_json::from_str(&state_raw)?;
                projection.position = position as u64;
            }
            None => {
                projection.state = Map::new();
                projection.position = 0;
                save(self.database(), &projection)?;
            }
        }

        tracing::debug!(
            projection = %projection.name,
            position = projection.position,
            "registered projection"
        );
        self.projections.insert(projection.name.clone(), projection);
        Ok(())
    }

    /// Rebuild a projection from scratch over the full event log.
    ///
    /// Resets `(state, position)` to `({}, 0)`, streams every event in
    /// global order, runs handlers for the event types that have one, sets
    /// the cursor to the maximum position seen, and persists the result.
    ///
    /// # Returns
    ///
    /// The number of events observed (not just handled).
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownProjection`] if the name is not registered;
    /// [`StoreError::ProjectionHandler`] if a handler fails -- the cursor
    /// is not persisted in that case.
    pub fn rebuild(&mut self, name: &str) -> Result<u64> {
        let database = self.store.database().clone();
        let projection = self
            .projections
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownProjection(name.to_string()))?;

        projection.state = Map::new();
        projection.position = 0;

        let events = self.store.load_all_events(0)?;
        let mut count = 0u64;
        for event in &events {
            projection.handle(event)?;
            projection.position = event.position;
            count += 1;
        }
        save(&database, projection)?;

        tracing::info!(projection = %name, events = count, "rebuilt projection");
        Ok(count)
    }

    /// Advance a projection over events past its persisted cursor.
    ///
    /// Like [`rebuild`](ProjectionManager::rebuild) but starts at the
    /// current cursor and does not reset state. When no new events exist,
    /// returns 0 without touching the persisted row.
    ///
    /// # Returns
    ///
    /// The number of events observed.
    pub fn advance(&mut self, name: &str) -> Result<u64> {
        let database = self.store.database().clone();
        let projection = self
            .projections
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownProjection(name.to_string()))?;

        let events = self.store.load_all_events(projection.position)?;
        if events.is_empty() {
            return Ok(0);
        }

        let mut count = 0u64;
        for event in &events {
            // Cursor moves only after the handler succeeds, so a failing
            // event is re-read by the next pass.
            projection.handle(event)?;
            projection.position = event.position;
            count += 1;
        }
        save(&database, projection)?;
        Ok(count)
    }

    /// Advance every registered projection.
    ///
    /// The order among projections is unspecified; each one persists its
    /// own `(state, position)` row atomically.
    ///
    /// # Returns
    ///
    /// Map from projection name to the number of events it observed.
    pub fn advance_all(&mut self) -> Result<HashMap<String, u64>> {
        let names: Vec<String> = self.projections.keys().cloned().collect();
        let mut counts = HashMap::with_capacity(names.len());
        for name in names {
            let count = self.advance(&name)?;
            counts.insert(name, count);
        }
        Ok(counts)
    }

    /// Query a projection's in-memory state.
    ///
    /// With `key = None`, returns the full state mapping as a JSON object;
    /// otherwise returns `state[key]`, or `Value::Null` when the key is
    /// absent.
    pub fn query(&self, name: &str, key: Option<&str>) -> Result<Value> {
        let projection = self
            .projections
            .get(name)
            .ok_or_else(|| StoreError::UnknownProjection(name.to_string()))?;
        Ok(match key {
            None => Value::Object(projection.state.clone()),
            Some(key) => projection.state.get(key).cloned().unwrap_or(Value::Null),
        })
    }

    fn database(&self) -> &Database {
        self.store.database()
    }
}

/// Persist a projection's state and cursor in one row write.
///
/// `INSERT OR REPLACE` keeps state and cursor in a single statement, which
/// is the atomic commit point for a rebuild or advance pass.
fn save(db: &Database, projection: &Projection) -> Result<()> {
    let state = serde_json::to_string(&projection.state)?;
    db.conn().execute(
        "INSERT OR REPLACE INTO projections (name, state, position) VALUES (?1, ?2, ?3)",
        params![projection.name, state, projection.position as i64],
    )?;
    Ok(())
}
