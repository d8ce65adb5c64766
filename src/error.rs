//! Crate-level error types for store, projection, and dispatch failures.

/// Error type produced by user-supplied command and projection handlers.
///
/// Boxed so domain code can bubble up whatever concrete error it likes;
/// the engine only ever needs `Display` to record it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the event store and the components built on it.
///
/// The command bus never returns `StoreError` for handler failures -- those
/// are captured into [`DispatchOutcome`](crate::DispatchOutcome) records.
/// Everything else propagates to the caller.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The per-aggregate version chain would be broken by an append.
    ///
    /// Raised when the batch is empty, targets a different aggregate,
    /// contains non-contiguous versions, or does not continue from the
    /// aggregate's current head version. The caller should reload the
    /// aggregate, rebuild its intended events, and retry.
    #[error("version conflict on aggregate '{aggregate_id}': {reason}")]
    VersionConflict {
        /// Aggregate whose version chain was violated.
        aggregate_id: String,
        /// What precondition failed.
        reason: String,
    },

    /// Underlying SQLite failure.
    ///
    /// Covers I/O errors, constraint violations outside the version-chain
    /// check, and corrupt stored rows that fail to decode. Retryable with
    /// backoff when transient.
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),

    /// A payload, state mapping, or metadata value could not be encoded.
    ///
    /// Programmer error; fatal for the affected row.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A projection name was used before being registered.
    #[error("projection '{0}' is not registered")]
    UnknownProjection(String),

    /// A projection handler failed while processing an event.
    ///
    /// The advance or rebuild aborts at the failing event; the cursor is
    /// not persisted past it, so the next pass re-reads the same event.
    #[error("projection '{name}' handler failed at position {position}: {message}")]
    ProjectionHandler {
        /// Name of the projection whose handler failed.
        name: String,
        /// Global position of the event being processed.
        position: u64,
        /// Stringified handler error.
        message: String,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflict_display_names_aggregate_and_reason() {
        let err = StoreError::VersionConflict {
            aggregate_id: "order-1".to_string(),
            reason: "expected version 2, got 5".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "version conflict on aggregate 'order-1': expected version 2, got 5"
        );
    }

    #[test]
    fn unknown_projection_display() {
        let err = StoreError::UnknownProjection("totals".to_string());
        assert_eq!(err.to_string(), "projection 'totals' is not registered");
    }

    #[test]
    fn projection_handler_display_carries_position() {
        let err = StoreError::ProjectionHandler {
            name: "totals".to_string(),
            position: 42,
            message: "boom".to_string(),
        };
        assert!(err.to_string().contains("position 42"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn serialization_from_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err = StoreError::from(json_err);
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    // Errors cross thread boundaries when stores are shared between threads.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<StoreError>();
        }
    };
}
