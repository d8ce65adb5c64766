//! Aggregate snapshots: persisted collapsed state used to short-circuit replay.
//!
//! Snapshot rows are append-only like everything else in the store --
//! creating a new snapshot inserts a new row, and readers take the one
//! with the highest version.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::storage::Database;

/// A point-in-time collapsed state of an aggregate.
///
/// `version` is the aggregate version the snapshot collapses up to and
/// including; reconstruction resumes replay from `version + 1`. For any
/// snapshot, applying events `1..=version` to the empty state yields
/// exactly `state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Aggregate instance identifier.
    pub aggregate_id: String,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Version the snapshot collapses up to and including.
    pub version: u64,
    /// The aggregate state at that version.
    pub state: Map<String, Value>,
    /// UTC creation time.
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Build a snapshot stamped with the current UTC time.
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        version: u64,
        state: Map<String, Value>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            version,
            state,
            created_at: Utc::now(),
        }
    }
}

/// Insert a snapshot row.
///
/// Always inserts -- older snapshots for the same aggregate are kept and
/// simply shadowed by the higher version.
pub(crate) fn save(db: &Database, snapshot: &Snapshot) -> Result<()> {
    let state = serde_json::to_string(&snapshot.state)?;
    db.conn().execute(
        "INSERT INTO snapshots (aggregate_id, aggregate_type, version, state, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            snapshot.aggregate_id,
            snapshot.aggregate_type,
            snapshot.version as i64,
            state,
            snapshot.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Load the latest snapshot for an aggregate, if any.
///
/// "Latest" is the row with the highest version.
pub(crate) fn load_latest(db: &Database, aggregate_id: &str) -> Result<Option<Snapshot>> {
    let conn = db.conn();
    let snapshot = conn
        .query_row(
            "SELECT aggregate_id, aggregate_type, version, state, created_at
             FROM snapshots WHERE aggregate_id = ?1
             ORDER BY version DESC LIMIT 1",
            params![aggregate_id],
            |row| {
                let state_raw: String = row.get(3)?;
                let state: Map<String, Value> = serde_json::from_str(&state_raw)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
                let created_raw: String = row.get(4)?;
                let created_at = DateTime::parse_from_rfc3339(&created_raw)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?
                    .with_timezone(&Utc);
                Ok(Snapshot {
                    aggregate_id: row.get(0)?,
                    aggregate_type: row.get(1)?,
                    version: row.get::<_, i64>(2)? as u64,
                    state,
                    created_at,
                })
            },
        )
        .optional()?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MEMORY_PATH;
    use serde_json::json;

    fn state_with(key: &str, value: Value) -> Map<String, Value> {
        let mut state = Map::new();
        state.insert(key.to_string(), value);
        state
    }

    #[test]
    fn save_then_load_roundtrips() {
        let db = Database::open(MEMORY_PATH).expect("open should succeed");
        let snapshot = Snapshot::new("agg-1", "Order", 2, state_with("status", json!("paid")));

        save(&db, &snapshot).expect("save should succeed");
        let loaded = load_latest(&db, "agg-1")
            .expect("load should succeed")
            .expect("snapshot should exist");

        assert_eq!(loaded.aggregate_id, "agg-1");
        assert_eq!(loaded.aggregate_type, "Order");
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.state["status"], "paid");
    }

    #[test]
    fn load_unknown_aggregate_returns_none() {
        let db = Database::open(MEMORY_PATH).expect("open should succeed");
        let loaded = load_latest(&db, "nope").expect("load should succeed");
        assert!(loaded.is_none());
    }

    #[test]
    fn latest_snapshot_wins_by_version() {
        let db = Database::open(MEMORY_PATH).expect("open should succeed");
        save(
            &db,
            &Snapshot::new("agg-1", "Order", 3, state_with("n", json!(3))),
        )
        .expect("save v3 should succeed");
        save(
            &db,
            &Snapshot::new("agg-1", "Order", 7, state_with("n", json!(7))),
        )
        .expect("save v7 should succeed");
        save(
            &db,
            &Snapshot::new("agg-1", "Order", 5, state_with("n", json!(5))),
        )
        .expect("save v5 should succeed");

        let loaded = load_latest(&db, "agg-1")
            .expect("load should succeed")
            .expect("snapshot should exist");
        assert_eq!(loaded.version, 7, "highest version wins, not insert order");
        assert_eq!(loaded.state["n"], 7);
    }

    #[test]
    fn snapshots_are_scoped_per_aggregate() {
        let db = Database::open(MEMORY_PATH).expect("open should succeed");
        save(
            &db,
            &Snapshot::new("a", "Order", 1, state_with("who", json!("a"))),
        )
        .expect("save a should succeed");
        save(
            &db,
            &Snapshot::new("b", "Order", 9, state_with("who", json!("b"))),
        )
        .expect("save b should succeed");

        let loaded = load_latest(&db, "a")
            .expect("load should succeed")
            .expect("snapshot should exist");
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.state["who"], "a");
    }
}
