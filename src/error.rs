/// Error types for mnemon operations.
///
/// This module provides the error hierarchy covering every failure mode in
/// the engine. Errors split into two propagation classes: user errors are
/// returned to the caller verbatim; everything else is converted into a
/// degraded success by the engine and recorded in the operation history.
use thiserror::Error;

/// The main error type for mnemon operations.
///
/// All fallible operations in mnemon return `Result<T, MemoryError>`.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Item id does not exist in the graph
    #[error("Item '{id}' not found")]
    ItemNotFound {
        /// The id that was not found
        id: String,
    },

    /// Edge operation referenced a missing endpoint
    #[error("Edge endpoint missing: '{from}' -> '{to}'")]
    DanglingEdge {
        /// Source item id
        from: String,
        /// Target item id
        to: String,
    },

    /// Policy version id does not exist for the named function
    #[error("No version '{version_id}' recorded for policy function '{name}'")]
    UnknownPolicyVersion {
        /// Policy function name (decay, recallScore, exploration)
        name: String,
        /// The version id that was requested
        version_id: String,
    },

    /// Unknown policy function name
    #[error("Unknown policy function '{name}' (expected decay, recallScore or exploration)")]
    UnknownPolicyFn {
        /// The name that was requested
        name: String,
    },

    /// Malformed caller input (empty text, bad ttl string, out-of-range param)
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of what was wrong
        reason: String,
    },

    /// Expression rejected at set time (parse failure or failed probe)
    #[error("Expression rejected: {reason}")]
    ExpressionRejected {
        /// Parser or probe diagnostic
        reason: String,
    },

    /// Expression failed at evaluation time
    #[error("Expression evaluation failed: {reason}")]
    EvalError {
        /// Evaluator diagnostic
        reason: String,
    },

    /// Expression evaluation exceeded its budget (wall clock or step count)
    #[error("Expression evaluation timed out")]
    EvalTimeout,

    /// Snapshot read/write failed
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Serialization error when converting state to/from JSON
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl MemoryError {
    /// Whether this error belongs to the user-error class that propagates to
    /// the caller unchanged. Everything else degrades to a fallback inside
    /// the engine.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            MemoryError::ItemNotFound { .. }
                | MemoryError::DanglingEdge { .. }
                | MemoryError::UnknownPolicyVersion { .. }
                | MemoryError::UnknownPolicyFn { .. }
                | MemoryError::InvalidArgument { .. }
                | MemoryError::ExpressionRejected { .. }
        )
    }
}

/// Result type alias for mnemon operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
