//! Commands, dispatch outcomes, and the command bus.
//!
//! Every dispatch is recorded in the `command_log` audit table: a `pending`
//! row before the handler runs, updated to `ok` or `error` afterwards. The
//! audit row is advisory -- it is written in its own transactions, separate
//! from any events the handler appends.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{HandlerError, Result};
use crate::store::EventStore;

/// A validated intent to change state, routed through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Unique command identifier (UUID v4); the natural `caused_by` value
    /// for events the handler raises.
    pub id: Uuid,
    /// Command type name the handler registry is keyed by.
    pub command_type: String,
    /// Opaque JSON payload.
    pub payload: Value,
    /// Identity of the issuer, when known.
    pub issued_by: Option<String>,
    /// UTC time the command was constructed.
    pub issued_at: DateTime<Utc>,
}

impl Command {
    fn new(command_type: impl Into<String>, payload: Value, issued_by: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_type: command_type.into(),
            payload,
            issued_by: issued_by.map(str::to_string),
            issued_at: Utc::now(),
        }
    }
}

/// Structured result of a dispatch.
///
/// Serializes to the wire shape `{"status": "ok", "result": ...}` or
/// `{"status": "error", "message": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DispatchOutcome {
    /// The handler ran and returned a result value.
    Ok {
        /// Whatever the handler returned.
        result: Value,
    },
    /// No handler was registered, or the handler failed.
    Error {
        /// Human-readable failure description.
        message: String,
    },
}

/// Handler signature: receives the command and the store, returns a JSON
/// result or a domain error. Errors are captured into the outcome and the
/// audit row; they are never propagated out of `dispatch`.
pub type CommandHandler =
    Box<dyn Fn(&Command, &EventStore) -> std::result::Result<Value, HandlerError> + Send + Sync>;

/// Routes commands to registered handlers and records every dispatch.
///
/// One handler per command type; registration replaces and is expected to
/// happen at startup. The bus is the only component in the engine that
/// swallows handler failures -- they come back as
/// [`DispatchOutcome::Error`], while storage failures on the audit path
/// still propagate as `Err`.
pub struct CommandBus {
    store: EventStore,
    handlers: HashMap<String, CommandHandler>,
}

impl CommandBus {
    /// Create a bus over the given store.
    pub fn new(store: EventStore) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a command type. Re-registration replaces.
    pub fn register<F>(&mut self, command_type: impl Into<String>, handler: F)
    where
        F: Fn(&Command, &EventStore) -> std::result::Result<Value, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let command_type = command_type.into();
        tracing::debug!(command_type = %command_type, "registered command handler");
        self.handlers.insert(command_type, Box::new(handler));
    }

    /// Dispatch a command and return the structured outcome.
    ///
    /// Protocol:
    ///
    /// 1. Construct a [`Command`] with a fresh id and timestamp.
    /// 2. Insert a `pending` audit row.
    /// 3. Without a registered handler, update the row to `error` and
    ///    return an error outcome (message `no handler for <type>`).
    /// 4. Run the handler; update the row to `ok` with the result, or to
    ///    `error` with the stringified failure. The failure itself is not
    ///    propagated.
    ///
    /// # Errors
    ///
    /// Only audit-path failures escape:
    /// [`StoreError::Unavailable`](crate::StoreError::Unavailable) when a
    /// `command_log` write fails,
    /// [`StoreError::Serialization`](crate::StoreError::Serialization) when
    /// the payload or result cannot be encoded.
    pub fn dispatch(
        &self,
        command_type: &str,
        payload: Value,
        issued_by: Option<&str>,
    ) -> Result<DispatchOutcome> {
        let command = Command::new(command_type, payload, issued_by);
        self.log_pending(&command)?;

        let Some(handler) = self.handlers.get(command_type) else {
            let message = format!("no handler for {command_type}");
            tracing::warn!(command_type = %command_type, "dispatch without handler");
            self.log_error(&command, &message)?;
            return Ok(DispatchOutcome::Error { message });
        };

        match handler(&command, &self.store) {
            Ok(result) => {
                self.log_ok(&command, &result)?;
                Ok(DispatchOutcome::Ok { result })
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(
                    command_type = %command_type,
                    command_id = %command.id,
                    error = %message,
                    "command handler failed"
                );
                self.log_error(&command, &message)?;
                Ok(DispatchOutcome::Error { message })
            }
        }
    }

    fn log_pending(&self, command: &Command) -> Result<()> {
        let payload = serde_json::to_string(&command.payload)?;
        self.store.database().conn().execute(
            "INSERT INTO command_log (id, command_type, payload, issued_by, issued_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            params![
                command.id.to_string(),
                command.command_type,
                payload,
                command.issued_by,
                command.issued_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn log_ok(&self, command: &Command, result: &Value) -> Result<()> {
        let result = serde_json::to_string(result)?;
        self.store.database().conn().execute(
            "UPDATE command_log SET status = 'ok', result = ?1 WHERE id = ?2",
            params![result, command.id.to_string()],
        )?;
        Ok(())
    }

    fn log_error(&self, command: &Command, message: &str) -> Result<()> {
        self.store.database().conn().execute(
            "UPDATE command_log SET status = 'error', error_message = ?1 WHERE id = ?2",
            params![message, command.id.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use serde_json::json;

    /// Fetch `(status, result, error_message)` of the single audit row.
    fn audit_row(store: &EventStore) -> (String, Option<String>, Option<String>) {
        store
            .database()
            .conn()
            .query_row(
                "SELECT status, result, error_message FROM command_log",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("exactly one audit row expected")
    }

    fn create_order_handler(
        command: &Command,
        store: &EventStore,
    ) -> std::result::Result<Value, HandlerError> {
        let id = command.payload["id"]
            .as_str()
            .ok_or("missing order id")?
            .to_string();
        let event = Event::create(
            &id,
            "Order",
            "OrderCreated",
            command.payload.clone(),
            1,
        )
        .with_caused_by(command.id.to_string());
        store.append(&id, &[event])?;
        Ok(json!({"id": id}))
    }

    #[test]
    fn dispatch_success_returns_result_and_logs_ok() {
        let store = EventStore::in_memory().expect("open should succeed");
        let mut bus = CommandBus::new(store.clone());
        bus.register("CreateOrder", create_order_handler);

        let outcome = bus
            .dispatch("CreateOrder", json!({"id": "o9", "total": 5}), None)
            .expect("dispatch should succeed");
        assert_eq!(
            outcome,
            DispatchOutcome::Ok {
                result: json!({"id": "o9"})
            }
        );

        let (status, result, error_message) = audit_row(&store);
        assert_eq!(status, "ok");
        assert_eq!(result.as_deref(), Some(r#"{"id":"o9"}"#));
        assert_eq!(error_message, None);

        // The handler's event landed in the store with a causation link.
        let events = store.load("o9", 0).expect("load should succeed");
        assert_eq!(events.len(), 1);
        assert!(events[0].caused_by.is_some());
    }

    #[test]
    fn dispatch_without_handler_returns_error_outcome() {
        let store = EventStore::in_memory().expect("open should succeed");
        let bus = CommandBus::new(store.clone());

        let outcome = bus
            .dispatch("Unknown", json!({}), None)
            .expect("dispatch should succeed");
        assert_eq!(
            outcome,
            DispatchOutcome::Error {
                message: "no handler for Unknown".to_string()
            }
        );

        let (status, _result, error_message) = audit_row(&store);
        assert_eq!(status, "error");
        assert_eq!(error_message.as_deref(), Some("no handler for Unknown"));
    }

    #[test]
    fn handler_failure_is_captured_not_propagated() {
        let store = EventStore::in_memory().expect("open should succeed");
        let mut bus = CommandBus::new(store.clone());
        bus.register("AlwaysFails", |_command, _store| Err("insufficient funds".into()));

        let outcome = bus
            .dispatch("AlwaysFails", json!({}), Some("alice"))
            .expect("dispatch itself must not fail");
        assert_eq!(
            outcome,
            DispatchOutcome::Error {
                message: "insufficient funds".to_string()
            }
        );

        let (status, _result, error_message) = audit_row(&store);
        assert_eq!(status, "error");
        assert_eq!(error_message.as_deref(), Some("insufficient funds"));
    }

    #[test]
    fn store_errors_inside_handlers_become_error_outcomes() {
        let store = EventStore::in_memory().expect("open should succeed");
        let mut bus = CommandBus::new(store.clone());
        // Appending at a conflicting version surfaces a VersionConflict
        // inside the handler; the bus reports it, not the caller's Err path.
        bus.register("BadAppend", |command, store| {
            let event = Event::create("x", "Order", "Created", json!({}), 7)
                .with_caused_by(command.id.to_string());
            store.append("x", &[event])?;
            Ok(json!({}))
        });

        let outcome = bus
            .dispatch("BadAppend", json!({}), None)
            .expect("dispatch should succeed");
        match outcome {
            DispatchOutcome::Error { message } => {
                assert!(message.contains("version conflict"), "got: {message}")
            }
            other => panic!("expected error outcome, got: {other:?}"),
        }
    }

    #[test]
    fn audit_row_records_issuer_and_payload() {
        let store = EventStore::in_memory().expect("open should succeed");
        let bus = CommandBus::new(store.clone());
        bus.dispatch("Nope", json!({"k": "v"}), Some("svc-batch"))
            .expect("dispatch should succeed");

        let (payload, issued_by): (String, Option<String>) = store
            .database()
            .conn()
            .query_row(
                "SELECT payload, issued_by FROM command_log",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("audit row should exist");
        assert_eq!(payload, r#"{"k":"v"}"#);
        assert_eq!(issued_by.as_deref(), Some("svc-batch"));
    }

    #[test]
    fn reregistration_replaces_handler() {
        let store = EventStore::in_memory().expect("open should succeed");
        let mut bus = CommandBus::new(store);
        bus.register("Ping", |_command, _store| Ok(json!("first")));
        bus.register("Ping", |_command, _store| Ok(json!("second")));

        let outcome = bus
            .dispatch("Ping", json!({}), None)
            .expect("dispatch should succeed");
        assert_eq!(
            outcome,
            DispatchOutcome::Ok {
                result: json!("second")
            }
        );
    }

    #[test]
    fn outcome_serializes_to_status_tagged_json() {
        let ok = DispatchOutcome::Ok {
            result: json!({"id": "o1"}),
        };
        assert_eq!(
            serde_json::to_value(&ok).expect("serialize"),
            json!({"status": "ok", "result": {"id": "o1"}})
        );

        let err = DispatchOutcome::Error {
            message: "no handler for X".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&err).expect("serialize"),
            json!({"status": "error", "message": "no handler for X"})
        );
    }
}
