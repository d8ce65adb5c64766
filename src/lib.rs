//! Embedded event-sourcing / CQRS engine backed by SQLite.
//!
//! `foldlog` keeps a durable, append-only log of immutable domain events in
//! a local SQLite database and provides the machinery around it: aggregate
//! reconstruction by snapshot + delta replay, incremental restartable
//! projections with persisted cursors, and a command bus that records every
//! dispatch in an audit table. No server, no background threads -- the
//! whole engine lives inside the host process.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`Event`] | Immutable, versioned record of a past domain fact |
//! | [`EventStore`] | Append-only log: append, query, snapshot, reconstruct |
//! | [`Aggregate`] | Consistency boundary; state is the fold of its events |
//! | [`Projection`] | Named read model advanced over the global stream |
//! | [`ProjectionManager`] | Registers, persists, rebuilds, advances projections |
//! | [`CommandBus`] | Routes commands to handlers, audits every dispatch |
//! | [`EventSourcingSystem`] | Facade composing the store, bus, and manager |
//!
//! # Guarantees
//!
//! Per-aggregate versions are contiguous from 1 and appends violating the
//! chain fail atomically. The global `position` is strictly increasing and
//! assigned only by the store. Projection rebuilds are deterministic: a
//! rebuild from position 0 always lands on the same `(state, position)`
//! regardless of how advances were interleaved before it.
//!
//! # Quick Start
//!
//! ```
//! use foldlog::{Event, EventSourcingSystem, Projection};
//! use serde_json::json;
//!
//! # fn main() -> foldlog::Result<()> {
//! let mut system = EventSourcingSystem::in_memory()?;
//!
//! // Append a domain event through the store.
//! let event = Event::create("order-1", "Order", "OrderCreated", json!({"total": 10}), 1);
//! system.store().append("order-1", &[event])?;
//!
//! // Maintain a read model and catch it up over the log.
//! let totals = Projection::new("totals").on("OrderCreated", |state, event| {
//!     state.insert(event.aggregate_id.clone(), event.payload["total"].clone());
//!     Ok(())
//! });
//! system.projections().register(totals)?;
//! system.rebuild_projection("totals")?;
//! assert_eq!(system.query_projection("totals", Some("order-1"))?, json!(10));
//! # Ok(())
//! # }
//! ```
//!
//! Pass a filesystem path to [`EventSourcingSystem::open`] for a durable
//! store; the literal `":memory:"` keeps everything volatile.

mod aggregate;
mod command;
mod error;
mod event;
mod projection;
mod snapshot;
mod storage;
mod store;
mod system;

pub use aggregate::{default_apply, Aggregate, ApplyFn};
pub use command::{Command, CommandBus, CommandHandler, DispatchOutcome};
pub use error::{HandlerError, Result, StoreError};
pub use event::Event;
pub use projection::{Projection, ProjectionHandler, ProjectionManager};
pub use snapshot::Snapshot;
pub use storage::MEMORY_PATH;
pub use store::EventStore;
pub use system::{EventSourcingSystem, Statistics};
