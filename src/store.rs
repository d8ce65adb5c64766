//! The append-only event store: append, query, snapshot, reconstruct.
//!
//! All write invariants live here. Appends run in a single SQLite
//! transaction that validates the per-aggregate version chain before
//! inserting; the store-global `position` comes from the events table's
//! AUTOINCREMENT key, so positions are strictly increasing in commit order
//! and never reused.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::aggregate::{Aggregate, ApplyFn};
use crate::error::{Result, StoreError};
use crate::event::Event;
use crate::snapshot::{self, Snapshot};
use crate::storage::Database;

/// Column list shared by every event query, in [`row_to_event`] order.
const EVENT_COLUMNS: &str = "position, id, aggregate_id, aggregate_type, event_type, \
     payload, version, timestamp, caused_by, metadata";

/// Append-only event store over a SQLite database.
///
/// Cheap to clone: clones share the connection and the aggregate factory
/// registry. The store owns all write invariants:
///
/// - per-aggregate versions are contiguous from 1 (violations fail the
///   whole append atomically with [`StoreError::VersionConflict`]);
/// - the global position is strictly increasing and assigned only here;
/// - appended events are never updated or deleted.
///
/// # Examples
///
/// ```
/// use foldlog::{Event, EventStore};
/// use serde_json::json;
///
/// # fn main() -> foldlog::Result<()> {
/// let store = EventStore::in_memory()?;
/// let event = Event::create("order-1", "Order", "OrderCreated", json!({"total": 10}), 1);
/// let positions = store.append("order-1", &[event])?;
/// assert_eq!(positions, vec![1]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct EventStore {
    db: Database,
    factories: Arc<RwLock<HashMap<String, ApplyFn>>>,
}

impl EventStore {
    /// Open (or create) a store at `db_path`.
    ///
    /// The literal `":memory:"` opens a volatile in-memory store; any other
    /// string is a filesystem path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be opened
    /// or its schema cannot be applied.
    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self {
            db: Database::open(db_path)?,
            factories: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Open a volatile in-memory store.
    pub fn in_memory() -> Result<Self> {
        Self::open(crate::storage::MEMORY_PATH)
    }

    /// Shared database handle for sibling components (bus, manager, facade).
    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    /// Register the event-application behavior for an aggregate type.
    ///
    /// [`reconstruct`](EventStore::reconstruct) materializes aggregates of
    /// this type with the given applier; types without a registration fall
    /// back to the copy-payload default. Re-registration replaces.
    ///
    /// Registration is expected to happen once at startup, before any
    /// reconstruction runs.
    pub fn register_aggregate(&self, aggregate_type: impl Into<String>, apply_fn: ApplyFn) {
        let aggregate_type = aggregate_type.into();
        tracing::debug!(aggregate_type = %aggregate_type, "registered aggregate applier");
        self.factories
            .write()
            .expect("aggregate factory registry lock poisoned")
            .insert(aggregate_type, apply_fn);
    }

    /// Materialize a fresh aggregate of the given type.
    fn new_aggregate(&self, aggregate_id: &str, aggregate_type: &str) -> Aggregate {
        let factories = self
            .factories
            .read()
            .expect("aggregate factory registry lock poisoned");
        match factories.get(aggregate_type) {
            Some(apply_fn) => Aggregate::with_apply(aggregate_id, aggregate_type, *apply_fn),
            None => Aggregate::new(aggregate_id, aggregate_type),
        }
    }

    /// Append a batch of events for one aggregate, returning their positions.
    ///
    /// The whole batch is inserted in a single transaction. Preconditions,
    /// all of which fail with [`StoreError::VersionConflict`] and persist
    /// nothing:
    ///
    /// - the batch is non-empty;
    /// - every event's `aggregate_id` matches the argument;
    /// - versions within the batch are contiguous ascending;
    /// - the first version continues the aggregate's current head
    ///   (`current_max_version + 1`, i.e. 1 for a fresh aggregate).
    ///
    /// # Returns
    ///
    /// The store-assigned global positions, in batch order. Positions
    /// within one call are contiguous.
    ///
    /// # Errors
    ///
    /// [`StoreError::VersionConflict`] on any precondition failure,
    /// [`StoreError::Serialization`] if a payload or metadata mapping
    /// cannot be encoded, [`StoreError::Unavailable`] on SQLite failure.
    pub fn append(&self, aggregate_id: &str, events: &[Event]) -> Result<Vec<u64>> {
        if events.is_empty() {
            return Err(StoreError::VersionConflict {
                aggregate_id: aggregate_id.to_string(),
                reason: "empty event batch".to_string(),
            });
        }
        for event in events {
            if event.aggregate_id != aggregate_id {
                return Err(StoreError::VersionConflict {
                    aggregate_id: aggregate_id.to_string(),
                    reason: format!(
                        "event {} targets aggregate '{}'",
                        event.id, event.aggregate_id
                    ),
                });
            }
        }
        for pair in events.windows(2) {
            if pair[1].version != pair[0].version + 1 {
                return Err(StoreError::VersionConflict {
                    aggregate_id: aggregate_id.to_string(),
                    reason: format!(
                        "batch versions not contiguous: {} then {}",
                        pair[0].version, pair[1].version
                    ),
                });
            }
        }

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let head: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM events WHERE aggregate_id = ?1",
            params![aggregate_id],
            |row| row.get(0),
        )?;
        let expected = head as u64 + 1;
        if events[0].version != expected {
            return Err(StoreError::VersionConflict {
                aggregate_id: aggregate_id.to_string(),
                reason: format!("expected version {expected}, got {}", events[0].version),
            });
        }

        let mut positions = Vec::with_capacity(events.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO events (id, aggregate_id, aggregate_type, event_type, \
                 payload, version, timestamp, caused_by, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for event in events {
                let payload = serde_json::to_string(&event.payload)?;
                let metadata = serde_json::to_string(&event.metadata)?;
                stmt.execute(params![
                    event.id.to_string(),
                    event.aggregate_id,
                    event.aggregate_type,
                    event.event_type,
                    payload,
                    event.version as i64,
                    event.timestamp.to_rfc3339(),
                    event.caused_by,
                    metadata,
                ])?;
                positions.push(tx.last_insert_rowid() as u64);
            }
        }
        tx.commit()?;

        tracing::debug!(
            aggregate_id = %aggregate_id,
            count = events.len(),
            "appended events"
        );
        Ok(positions)
    }

    /// Load an aggregate's events with `version > from_version`, ascending.
    ///
    /// Pass `from_version = 0` for the full stream.
    pub fn load(&self, aggregate_id: &str, from_version: u64) -> Result<Vec<Event>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE aggregate_id = ?1 AND version > ?2 ORDER BY version ASC"
        ))?;
        let events = stmt
            .query_map(params![aggregate_id, from_version as i64], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Load all events of one aggregate type with `position > after_position`.
    pub fn load_all(&self, aggregate_type: &str, after_position: u64) -> Result<Vec<Event>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE aggregate_type = ?1 AND position > ?2 ORDER BY position ASC"
        ))?;
        let events = stmt
            .query_map(params![aggregate_type, after_position as i64], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Load the full global stream with `position > after_position`.
    pub fn load_all_events(&self, after_position: u64) -> Result<Vec<Event>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE position > ?1 ORDER BY position ASC"
        ))?;
        let events = stmt
            .query_map(params![after_position as i64], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// The largest position assigned so far, or 0 for an empty store.
    pub fn get_position(&self) -> Result<u64> {
        let position: i64 = self.db.conn().query_row(
            "SELECT COALESCE(MAX(position), 0) FROM events",
            [],
            |row| row.get(0),
        )?;
        Ok(position as u64)
    }

    /// Collapse an aggregate's current state into a new snapshot row.
    ///
    /// Reconstructs the aggregate (latest snapshot plus delta replay) and
    /// persists the result at the aggregate's head version. Returns `None`
    /// -- and persists nothing -- when the aggregate has no events. Any
    /// aggregate with at least one event may be snapshotted.
    pub fn create_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>> {
        let aggregate_type: Option<String> = self
            .db
            .conn()
            .query_row(
                "SELECT aggregate_type FROM events \
                 WHERE aggregate_id = ?1 ORDER BY version ASC LIMIT 1",
                params![aggregate_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(aggregate_type) = aggregate_type else {
            return Ok(None);
        };

        let aggregate = self.reconstruct(aggregate_id, &aggregate_type)?;
        let snapshot = Snapshot::new(
            aggregate_id,
            aggregate_type,
            aggregate.version,
            aggregate.state,
        );
        snapshot::save(&self.db, &snapshot)?;
        tracing::info!(
            aggregate_id = %aggregate_id,
            version = snapshot.version,
            "created snapshot"
        );
        Ok(Some(snapshot))
    }

    /// Load the latest snapshot for an aggregate, if any.
    pub fn load_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>> {
        snapshot::load_latest(&self.db, aggregate_id)
    }

    /// Reconstruct an aggregate from its latest snapshot plus delta replay.
    ///
    /// 1. Load the latest snapshot (may be absent).
    /// 2. Materialize a fresh aggregate of `aggregate_type` (registered
    ///    applier or the copy-payload default); seed state and version from
    ///    the snapshot when present.
    /// 3. Load events past the snapshot version and apply them in order.
    ///
    /// Yields the same state and version whether or not snapshots exist.
    pub fn reconstruct(&self, aggregate_id: &str, aggregate_type: &str) -> Result<Aggregate> {
        let mut aggregate = self.new_aggregate(aggregate_id, aggregate_type);

        let from_version = match self.load_snapshot(aggregate_id)? {
            Some(snapshot) => {
                aggregate.version = snapshot.version;
                aggregate.state = snapshot.state;
                snapshot.version
            }
            None => 0,
        };

        for event in self.load(aggregate_id, from_version)? {
            aggregate.apply(&event);
        }
        Ok(aggregate)
    }
}

/// Decode one `events` row into an [`Event`].
///
/// Column order matches [`EVENT_COLUMNS`]. Undecodable stored values (bad
/// UUID, timestamp, or JSON) surface as rusqlite conversion errors, i.e.
/// [`StoreError::Unavailable`] at the API boundary.
fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let id_raw: String = row.get(1)?;
    let id = Uuid::parse_str(&id_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;

    let payload_raw: String = row.get(5)?;
    let payload = serde_json::from_str(&payload_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    let timestamp_raw: String = row.get(7)?;
    let timestamp = chrono::DateTime::parse_from_rfc3339(&timestamp_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?
        .with_timezone(&chrono::Utc);

    let metadata_raw: Option<String> = row.get(9)?;
    let metadata = match metadata_raw {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?,
        None => serde_json::Map::new(),
    };

    Ok(Event {
        position: row.get::<_, i64>(0)? as u64,
        id,
        aggregate_id: row.get(2)?,
        aggregate_type: row.get(3)?,
        event_type: row.get(4)?,
        payload,
        version: row.get::<_, i64>(6)? as u64,
        timestamp,
        caused_by: row.get(8)?,
        metadata,
    })
}
