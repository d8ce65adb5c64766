//! Single entry point composing the store, command bus, and projections,
//! plus convenience queries (aggregate history, store statistics).

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::command::{CommandBus, DispatchOutcome};
use crate::error::Result;
use crate::projection::ProjectionManager;
use crate::store::EventStore;

/// Aggregate counts over the event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Statistics {
    /// Total number of events in the store.
    pub total_events: u64,
    /// Event count per event type.
    pub by_type: HashMap<String, u64>,
    /// Largest global position assigned so far (0 when empty).
    pub latest_position: u64,
}

/// Thin composition of one [`EventStore`], one [`CommandBus`], and one
/// [`ProjectionManager`] over a single database.
///
/// Register command handlers via [`command_bus`](EventSourcingSystem::command_bus)
/// and projections via [`projections`](EventSourcingSystem::projections) at
/// startup, then drive the system through the convenience methods.
///
/// # Examples
///
/// ```
/// use foldlog::{EventSourcingSystem, Projection};
///
/// # fn main() -> foldlog::Result<()> {
/// let mut system = EventSourcingSystem::in_memory()?;
/// system.projections().register(Projection::new("noop"))?;
/// assert_eq!(system.rebuild_projection("noop")?, 0);
/// # Ok(())
/// # }
/// ```
pub struct EventSourcingSystem {
    store: EventStore,
    command_bus: CommandBus,
    projections: ProjectionManager,
}

impl EventSourcingSystem {
    /// Open (or create) a system backed by the database at `db_path`.
    ///
    /// The literal `":memory:"` selects a volatile in-memory store.
    pub fn open(db_path: &str) -> Result<Self> {
        let store = EventStore::open(db_path)?;
        Ok(Self {
            command_bus: CommandBus::new(store.clone()),
            projections: ProjectionManager::new(store.clone()),
            store,
        })
    }

    /// Open a volatile in-memory system.
    pub fn in_memory() -> Result<Self> {
        Self::open(crate::storage::MEMORY_PATH)
    }

    /// The underlying event store.
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// The command bus, for handler registration at startup.
    pub fn command_bus(&mut self) -> &mut CommandBus {
        &mut self.command_bus
    }

    /// The projection manager, for registration and explicit advancing.
    pub fn projections(&mut self) -> &mut ProjectionManager {
        &mut self.projections
    }

    /// Dispatch a command through the bus. See [`CommandBus::dispatch`].
    pub fn dispatch_command(
        &self,
        command_type: &str,
        payload: Value,
        issued_by: Option<&str>,
    ) -> Result<DispatchOutcome> {
        self.command_bus.dispatch(command_type, payload, issued_by)
    }

    /// Rebuild a projection from the full log.
    /// See [`ProjectionManager::rebuild`].
    pub fn rebuild_projection(&mut self, name: &str) -> Result<u64> {
        self.projections.rebuild(name)
    }

    /// Query a projection's state. See [`ProjectionManager::query`].
    pub fn query_projection(&self, name: &str, key: Option<&str>) -> Result<Value> {
        self.projections.query(name, key)
    }

    /// All events of an aggregate as serialized JSON objects, ordered by
    /// version.
    pub fn get_aggregate_history(&self, aggregate_id: &str) -> Result<Vec<Value>> {
        let events = self.store.load(aggregate_id, 0)?;
        events
            .iter()
            .map(|event| serde_json::to_value(event).map_err(Into::into))
            .collect()
    }

    /// Event counts and the latest position.
    pub fn statistics(&self) -> Result<Statistics> {
        let latest_position = self.store.get_position()?;
        let conn = self.store.database().conn();

        let total_events: i64 =
            conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;

        let mut stmt =
            conn.prepare("SELECT event_type, COUNT(*) FROM events GROUP BY event_type")?;
        let by_type = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;

        Ok(Statistics {
            total_events: total_events as u64,
            by_type,
            latest_position,
        })
    }
}
